use std::path::PathBuf;

use anyhow::{Context, Result};
use lapin::options::{
    ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sync_rabbitmq::config::{self, AdapterConfig};
use sync_rabbitmq::rabbitmq::ManagedConnection;

fn main() -> Result<()> {
    // Setup tracing for logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    if let Some(flag) = args.next() {
        if flag == "--init-config" {
            let path = args
                .next()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE_NAME));
            return config::create_default_config_file(&path);
        }
        anyhow::bail!("Unknown argument {:?}; supported: --init-config [path]", flag);
    }

    let config = config::resolve_config()?;
    run(&config)
}

fn run(config: &AdapterConfig) -> Result<()> {
    let topology = &config.topology;

    let connection = ManagedConnection::connect(
        config.connection.connector(),
        config.connection.sync_options(),
    )
    .context("Failed to connect to RabbitMQ")?;
    let channel = connection.open_channel().context("Failed to open channel")?;

    channel.exchange_declare(
        &topology.exchange,
        ExchangeKind::Direct,
        ExchangeDeclareOptions {
            durable: topology.durable,
            ..ExchangeDeclareOptions::default()
        },
        FieldTable::default(),
    )?;
    info!(exchange = %topology.exchange, "Exchange declared");

    let declared = channel.queue_declare(
        &topology.queue,
        QueueDeclareOptions {
            durable: topology.durable,
            ..QueueDeclareOptions::default()
        },
        FieldTable::default(),
    )?;
    info!(
        queue = %declared.queue,
        messages = declared.message_count,
        consumers = declared.consumer_count,
        "Queue declared"
    );

    channel.queue_bind(
        &topology.queue,
        &topology.exchange,
        &topology.routing_key,
        QueueBindOptions::default(),
        FieldTable::default(),
    )?;
    info!(routing_key = %topology.routing_key, "Queue bound");

    if topology.cleanup {
        let purged = channel.queue_delete(&topology.queue, QueueDeleteOptions::default())?;
        channel.exchange_delete(&topology.exchange, ExchangeDeleteOptions::default())?;
        info!(purged, "Removed demo queue and exchange");
    }

    channel.close()?;
    connection.close()?;
    Ok(())
}
