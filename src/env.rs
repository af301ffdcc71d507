use std::env;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::config::AdapterConfig;

pub const AMQP_ADDR: &str = "AMQP_ADDR";
pub const POLL_INTERVAL_MS: &str = "SYNC_POLL_INTERVAL_MS";
pub const OPERATION_TIMEOUT_MS: &str = "SYNC_OPERATION_TIMEOUT_MS";

/// Settings taken from the environment (and `.env`), applied over the file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvOverrides {
    pub amqp_addr: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub operation_timeout_ms: Option<u64>,
}

impl EnvOverrides {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            amqp_addr: lookup(AMQP_ADDR),
            poll_interval_ms: parse_millis(&lookup, POLL_INTERVAL_MS)?,
            operation_timeout_ms: parse_millis(&lookup, OPERATION_TIMEOUT_MS)?,
        })
    }

    pub fn apply(&self, config: &mut AdapterConfig) {
        if let Some(uri) = &self.amqp_addr {
            config.connection.uri = uri.clone();
        }
        if let Some(interval) = self.poll_interval_ms {
            config.connection.poll_interval_ms = interval;
        }
        if let Some(timeout) = self.operation_timeout_ms {
            config.connection.operation_timeout_ms = Some(timeout);
        }
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => val
            .trim()
            .parse()
            .map(Some)
            .context(format!("{} must be a number of milliseconds, got {:?}", key, val)),
        None => Ok(None),
    }
}
