//! Seam between the blocking adapter and the callback-driven broker client.
//!
//! The adapter never talks to sockets or frames itself. It consumes an event
//! loop that can be stepped one iteration at a time, a connection that reports
//! open/close through callbacks, and a channel with one request method per
//! management operation. Every callback is dispatched from inside
//! [`EventLoop::poll_once`] on the thread that drives the loop.

use std::rc::Rc;

use amq_protocol_types::ShortUInt;
use lapin::options::{
    BasicCancelOptions, ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::ExchangeKind;

use super::errors::Result;

/// AMQP reply code as carried by close notifications.
pub type ReplyCode = ShortUInt;

/// Channel number on a connection.
pub type ChannelNumber = ShortUInt;

/// Completion callback for a single request. `FnOnce`, so it fills at most once.
pub type Completion<T> = Box<dyn FnOnce(T)>;

/// Close notification: reply code and reply text.
pub type CloseCallback = Box<dyn Fn(ReplyCode, &str)>;

/// Reply to `queue.declare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    pub queue: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// One cooperative iteration of I/O readiness and callback dispatch.
pub trait EventLoop {
    fn poll_once(&self);
}

/// Starts an asynchronous connect.
pub trait Connector {
    type Connection: RawConnection;

    /// Human readable connection parameters used in logs and error messages.
    fn params(&self) -> String;

    /// Begin connecting. `on_open` fires once the handshake completes and
    /// `on_close` on every later (or failed) close, both from inside
    /// [`EventLoop::poll_once`].
    fn connect(self, on_open: Completion<()>, on_close: CloseCallback) -> Result<Self::Connection>;
}

pub trait RawConnection {
    type Loop: EventLoop;
    type Channel: RawChannel;

    fn event_loop(&self) -> Rc<Self::Loop>;

    /// Request a new channel. The handle is returned at once; `on_open`
    /// fires when the broker confirms it.
    fn channel(&self, on_open: Completion<()>) -> Self::Channel;

    fn close(&self, reply_code: ReplyCode, reply_text: &str, done: Completion<()>);
}

pub trait RawChannel {
    fn channel_number(&self) -> ChannelNumber;

    fn add_on_close_callback(&self, callback: CloseCallback);

    fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
        done: Completion<QueueDeclareOk>,
    );

    fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
        done: Completion<()>,
    );

    fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
        done: Completion<()>,
    );

    fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeBindOptions,
        arguments: FieldTable,
        done: Completion<()>,
    );

    /// Completes with the number of messages deleted with the queue.
    fn queue_delete(&self, queue: &str, options: QueueDeleteOptions, done: Completion<u32>);

    fn exchange_delete(&self, exchange: &str, options: ExchangeDeleteOptions, done: Completion<()>);

    /// Fire-and-forget cancel of one consumer.
    fn basic_cancel(&self, consumer_tag: &str, options: BasicCancelOptions);

    fn close(&self, reply_code: ReplyCode, reply_text: &str, done: Completion<()>);
}
