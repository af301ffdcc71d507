// src/rabbitmq/errors.rs

use std::time::Duration;

use lapin::Error as LapinError;
use thiserror::Error;

use super::backend::{ChannelNumber, ReplyCode};

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("Connection {params} closed ({code}) {text}")]
    ConnectionClosed {
        params: String,
        code: ReplyCode,
        text: String,
    },

    #[error("Channel {channel} belongs to connection {params} closed ({code}) {text}")]
    ChannelClosed {
        channel: ChannelNumber,
        params: String,
        code: ReplyCode,
        text: String,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("A blocking call is already in flight on this connection")]
    OperationInFlight,

    #[error("Owning connection has been dropped")]
    ConnectionDropped,

    #[error("{0} is already closed")]
    AlreadyClosed(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Broker reply code carried by a close-triggered error.
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            RabbitMQError::ConnectionClosed { code, .. }
            | RabbitMQError::ChannelClosed { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Broker reply text carried by a close-triggered error.
    pub fn reply_text(&self) -> Option<&str> {
        match self {
            RabbitMQError::ConnectionClosed { text, .. }
            | RabbitMQError::ChannelClosed { text, .. } => Some(text),
            _ => None,
        }
    }
}

impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        RabbitMQError::ConnectionError(error.to_string())
    }
}

impl From<std::io::Error> for RabbitMQError {
    fn from(error: std::io::Error) -> Self {
        RabbitMQError::ConnectionError(format!("I/O error: {}", error))
    }
}
