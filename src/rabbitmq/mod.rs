// src/rabbitmq/mod.rs
// Blocking RabbitMQ calls on top of a callback-driven client

pub mod backend;
pub mod channel;
pub mod connection;
pub mod consumers;
pub mod errors;
pub mod lapin_backend;
pub mod latch;
pub mod lifecycle;
pub mod sync_await;

// Re-export specific items to simplify imports elsewhere
pub use backend::{
    ChannelNumber, CloseCallback, Completion, Connector, EventLoop, QueueDeclareOk, RawChannel,
    RawConnection, ReplyCode,
};
pub use channel::ManagedChannel;
pub use connection::{AttachChannel, ChannelFactory, ConnectionHandle, ManagedConnection};
pub use consumers::ConsumerRegistry;
pub use errors::{RabbitMQError, Result};
pub use lapin_backend::{LapinChannel, LapinConnection, LapinConnector, LapinEventLoop};
pub use latch::PendingLatch;
pub use lifecycle::{CloseReason, CloseState};
pub use sync_await::{sync_await, SyncOptions};

/// Connection over lapin, the usual entry point.
pub type LapinManagedConnection = ManagedConnection<LapinConnection>;

/// Channel over lapin.
pub type LapinManagedChannel = ManagedChannel<LapinConnection>;
