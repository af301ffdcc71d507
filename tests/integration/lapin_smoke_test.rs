// Runs against a real broker: `cargo test -- --ignored` with AMQP_ADDR set or
// a sync_rabbitmq.json in reach.

use lapin::options::{QueueDeclareOptions, QueueDeleteOptions};
use lapin::types::FieldTable;
use sync_rabbitmq::config;
use sync_rabbitmq::rabbitmq::LapinManagedConnection;

#[test]
#[ignore] // Ignore by default as it requires a running RabbitMQ instance
fn test_declare_and_delete_against_broker() {
    let config = config::resolve_config().expect("Failed to resolve configuration");
    let connection = LapinManagedConnection::connect(
        config.connection.connector(),
        config.connection.sync_options(),
    )
    .expect("Failed to connect to RabbitMQ");
    let channel = connection.open_channel().expect("Failed to open channel");

    let queue = format!("sync_rabbitmq_smoke_{}", std::process::id());
    let declared = channel
        .queue_declare(
            &queue,
            QueueDeclareOptions {
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .expect("Failed to declare queue");
    assert_eq!(declared.queue, queue);
    assert_eq!(declared.message_count, 0);

    let removed = channel
        .queue_delete(&queue, QueueDeleteOptions::default())
        .expect("Failed to delete queue");
    assert_eq!(removed, 0);

    channel.close().expect("Failed to close channel");
    connection.close().expect("Failed to close connection");
    assert!(!connection.is_open());
}
