use std::cell::RefCell;
use std::rc::{Rc, Weak};

use lapin::options::{
    BasicCancelOptions, ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use tracing::{debug, info, warn};

use super::backend::{
    ChannelNumber, Completion, QueueDeclareOk, RawChannel, RawConnection, ReplyCode,
};
use super::connection::{ConnectionHandle, ConnectionShared};
use super::consumers::ConsumerRegistry;
use super::errors::{RabbitMQError, Result};
use super::lifecycle::{CloseState, Lifecycle, Subject, REPLY_SUCCESS};

/// A channel whose management operations block until the broker replies.
///
/// Built by [`ManagedChannel::attach`], which installs the close handler
/// before the channel is handed to anyone.
pub struct ManagedChannel<C: RawConnection> {
    raw: C::Channel,
    owner: Weak<ConnectionShared<C>>,
    lifecycle: Rc<Lifecycle>,
    consumers: RefCell<ConsumerRegistry>,
}

impl<C: RawConnection> ManagedChannel<C> {
    pub fn attach(raw: C::Channel, owner: ConnectionHandle<C>) -> Self {
        let lifecycle = Rc::new(Lifecycle::new(Subject::Channel {
            number: raw.channel_number(),
            params: owner.params.clone(),
        }));

        let handler = Rc::clone(&lifecycle);
        raw.add_on_close_callback(Box::new(move |code: ReplyCode, text: &str| {
            handler.on_close(code, text)
        }));
        debug!(params = %owner.params, "Attached close handler to channel");

        Self {
            raw,
            owner: owner.shared,
            lifecycle,
            consumers: RefCell::new(ConsumerRegistry::new()),
        }
    }

    pub(crate) fn lifecycle(&self) -> &Rc<Lifecycle> {
        &self.lifecycle
    }

    pub(crate) fn mark_open(&self) {
        self.lifecycle.set_channel_number(self.raw.channel_number());
        self.lifecycle.mark_open();
    }

    pub fn channel_number(&self) -> ChannelNumber {
        self.raw.channel_number()
    }

    pub fn state(&self) -> CloseState {
        self.lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        self.lifecycle.is_open()
    }

    /// Blocking wrapper shared by every management operation: issue the raw
    /// request with our completion and drive the loop until it fires.
    fn synchronize<T, F>(&self, operation: &'static str, request: F) -> Result<T>
    where
        T: 'static,
        F: FnOnce(&C::Channel, Completion<T>),
    {
        let owner = self.owner.upgrade().ok_or(RabbitMQError::ConnectionDropped)?;
        owner.lifecycle().ensure_usable()?;
        self.lifecycle.ensure_usable()?;

        debug!(
            channel = self.channel_number(),
            params = owner.params(),
            operation,
            "Issuing blocking request"
        );
        owner.synchronize(Some(self.lifecycle.as_ref()), |done| request(&self.raw, done))
    }

    pub fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueDeclareOk> {
        self.synchronize("queue.declare", |raw, done| {
            raw.queue_declare(queue, options, arguments, done)
        })
    }

    pub fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        self.synchronize("exchange.declare", |raw, done| {
            raw.exchange_declare(exchange, kind, options, arguments, done)
        })
    }

    pub fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        self.synchronize("queue.bind", |raw, done| {
            raw.queue_bind(queue, exchange, routing_key, options, arguments, done)
        })
    }

    pub fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeBindOptions,
        arguments: FieldTable,
    ) -> Result<()> {
        self.synchronize("exchange.bind", |raw, done| {
            raw.exchange_bind(destination, source, routing_key, options, arguments, done)
        })
    }

    /// Returns the number of messages deleted with the queue.
    pub fn queue_delete(&self, queue: &str, options: QueueDeleteOptions) -> Result<u32> {
        self.synchronize("queue.delete", |raw, done| {
            raw.queue_delete(queue, options, done)
        })
    }

    pub fn exchange_delete(&self, exchange: &str, options: ExchangeDeleteOptions) -> Result<()> {
        self.synchronize("exchange.delete", |raw, done| {
            raw.exchange_delete(exchange, options, done)
        })
    }

    /// Remember a consumer started on this channel.
    pub fn track_consumer(&self, consumer_tag: impl Into<String>) -> bool {
        self.consumers.borrow_mut().track(consumer_tag)
    }

    pub fn forget_consumer(&self, consumer_tag: &str) -> bool {
        self.consumers.borrow_mut().forget(consumer_tag)
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        self.consumers.borrow().tags()
    }

    /// Send `basic.cancel` for every tracked consumer. Does not wait for
    /// `cancel-ok`. Returns how many cancels were issued.
    pub fn stop_consuming(&self) -> usize {
        let tags = self.consumers.borrow_mut().drain();
        for tag in &tags {
            debug!(channel = self.channel_number(), consumer_tag = %tag, "Cancelling consumer");
            self.raw.basic_cancel(tag, BasicCancelOptions::default());
        }
        tags.len()
    }

    /// Close the channel and block until the broker has confirmed it.
    pub fn close(&self) -> Result<()> {
        match self.lifecycle.state() {
            CloseState::ClosedNormally => return Ok(()),
            CloseState::ClosedUnexpectedly(_) => return self.lifecycle.check(),
            _ => {}
        }

        let owner = self.owner.upgrade().ok_or(RabbitMQError::ConnectionDropped)?;
        let remaining = self.consumers.borrow().len();
        if remaining > 0 {
            warn!(
                channel = self.channel_number(),
                remaining, "Closing channel with consumers still tracked"
            );
        }

        owner.synchronize(Some(self.lifecycle.as_ref()), |done| {
            self.raw.close(REPLY_SUCCESS, "Normal shutdown", done)
        })?;
        self.lifecycle.mark_closed();
        self.consumers.borrow_mut().drain();
        info!(channel = self.channel_number(), params = owner.params(), "Channel closed");
        Ok(())
    }
}
