use std::cell::Cell;
use std::rc::{Rc, Weak};

use tracing::{debug, info};

use super::backend::{CloseCallback, Completion, Connector, EventLoop, RawConnection, ReplyCode};
use super::channel::ManagedChannel;
use super::errors::{RabbitMQError, Result};
use super::latch::PendingLatch;
use super::lifecycle::{ChannelLifecycles, CloseState, Lifecycle, Subject, REPLY_SUCCESS};
use super::sync_await::{drive_until, sync_await, SyncOptions};

/// State shared between a connection and the channels opened on it.
pub(crate) struct ConnectionShared<C: RawConnection> {
    raw: C,
    event_loop: Rc<C::Loop>,
    params: String,
    lifecycle: Rc<Lifecycle>,
    channels: ChannelLifecycles,
    options: SyncOptions,
    in_flight: Cell<bool>,
}

/// Clears the in-flight flag when the blocking call returns or unwinds.
struct InFlight<'a>(&'a Cell<bool>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl<C: RawConnection> ConnectionShared<C> {
    pub(crate) fn params(&self) -> &str {
        &self.params
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn begin(&self) -> Result<InFlight<'_>> {
        if self.in_flight.replace(true) {
            return Err(RabbitMQError::OperationInFlight);
        }
        Ok(InFlight(&self.in_flight))
    }

    /// Connection close first, then any channel that closed unexpectedly,
    /// `channel` ahead of the others.
    fn watch(&self, channel: Option<&Lifecycle>) -> Result<()> {
        self.lifecycle.check()?;
        self.channels.take_failure(channel)
    }

    /// Issue one request and drive the loop until it completes. Every channel
    /// on this connection is watched while the loop runs.
    pub(crate) fn synchronize<T, F>(&self, channel: Option<&Lifecycle>, initiate: F) -> Result<T>
    where
        T: 'static,
        F: FnOnce(Completion<T>),
    {
        let _in_flight = self.begin()?;
        sync_await(
            &*self.event_loop,
            || self.watch(channel),
            self.options.operation_timeout,
            initiate,
        )
    }
}

/// Weak back-reference from a channel to its connection.
pub struct ConnectionHandle<C: RawConnection> {
    pub(crate) shared: Weak<ConnectionShared<C>>,
    pub(crate) params: String,
}

impl<C: RawConnection> ConnectionHandle<C> {
    pub fn params(&self) -> &str {
        &self.params
    }
}

/// Decides how raw channels are wrapped when a connection opens one.
///
/// [`ManagedChannel::attach`] is the only way to build a [`ManagedChannel`],
/// so every factory hands out channels with close detection installed.
pub trait ChannelFactory<C: RawConnection> {
    fn create(&self, raw: C::Channel, owner: ConnectionHandle<C>) -> ManagedChannel<C>;
}

/// Default factory: attach close detection and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct AttachChannel;

impl<C: RawConnection> ChannelFactory<C> for AttachChannel {
    fn create(&self, raw: C::Channel, owner: ConnectionHandle<C>) -> ManagedChannel<C> {
        ManagedChannel::attach(raw, owner)
    }
}

/// A broker connection whose operations block the calling thread.
pub struct ManagedConnection<C: RawConnection> {
    shared: Rc<ConnectionShared<C>>,
    factory: Box<dyn ChannelFactory<C>>,
}

impl<C: RawConnection> ManagedConnection<C> {
    /// Connect and block until the broker handshake has completed.
    pub fn connect<K>(connector: K, options: SyncOptions) -> Result<Self>
    where
        K: Connector<Connection = C>,
    {
        Self::connect_with_factory(connector, options, AttachChannel)
    }

    pub fn connect_with_factory<K, F>(connector: K, options: SyncOptions, factory: F) -> Result<Self>
    where
        K: Connector<Connection = C>,
        F: ChannelFactory<C> + 'static,
    {
        let params = connector.params();
        info!(%params, "Connecting to RabbitMQ");

        let lifecycle = Rc::new(Lifecycle::new(Subject::Connection {
            params: params.clone(),
        }));
        let opened = PendingLatch::new();

        let on_close: CloseCallback = {
            let lifecycle = Rc::clone(&lifecycle);
            Box::new(move |code: ReplyCode, text: &str| lifecycle.on_close(code, text))
        };
        let raw = connector.connect(opened.completion(), on_close)?;
        let event_loop = raw.event_loop();

        drive_until(
            &*event_loop,
            || lifecycle.check(),
            options.operation_timeout,
            &opened,
        )?;
        lifecycle.mark_open();
        info!(%params, "Connected to RabbitMQ");

        Ok(Self {
            shared: Rc::new(ConnectionShared {
                raw,
                event_loop,
                params,
                lifecycle,
                channels: ChannelLifecycles::default(),
                options,
                in_flight: Cell::new(false),
            }),
            factory: Box::new(factory),
        })
    }

    /// Open a channel and block until the broker has confirmed it.
    pub fn open_channel(&self) -> Result<ManagedChannel<C>> {
        let shared = &self.shared;
        shared.lifecycle.ensure_usable()?;
        let _in_flight = shared.begin()?;

        let opened = PendingLatch::new();
        let raw = shared.raw.channel(opened.completion());
        let channel = self.factory.create(
            raw,
            ConnectionHandle {
                shared: Rc::downgrade(shared),
                params: shared.params.clone(),
            },
        );

        shared.channels.register(channel.lifecycle());

        drive_until(
            &*shared.event_loop,
            || shared.watch(Some(channel.lifecycle().as_ref())),
            shared.options.operation_timeout,
            &opened,
        )?;
        channel.mark_open();
        info!(params = %shared.params, channel = channel.channel_number(), "Channel opened");

        Ok(channel)
    }

    /// Run exactly one loop iteration, e.g. to service inbound deliveries.
    /// A close of this connection or of any of its channels dispatched by
    /// that iteration is returned as an error.
    pub fn process_data_events(&self) -> Result<()> {
        let shared = &self.shared;
        shared.lifecycle.ensure_usable()?;
        let _in_flight = shared.begin()?;

        shared.event_loop.poll_once();
        shared.watch(None)
    }

    /// Close the connection and block until the broker has confirmed it.
    pub fn close(&self) -> Result<()> {
        let shared = &self.shared;
        match shared.lifecycle.state() {
            CloseState::ClosedNormally => return Ok(()),
            CloseState::ClosedUnexpectedly(_) => return shared.lifecycle.check(),
            _ => {}
        }

        debug!(params = %shared.params, "Closing connection");
        shared.synchronize(None, |done| {
            shared.raw.close(REPLY_SUCCESS, "Normal shutdown", done)
        })?;
        shared.lifecycle.mark_closed();
        info!(params = %shared.params, "Connection closed");
        Ok(())
    }

    pub fn params(&self) -> &str {
        &self.shared.params
    }

    pub fn state(&self) -> CloseState {
        self.shared.lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        self.shared.lifecycle.is_open()
    }

    pub fn options(&self) -> &SyncOptions {
        &self.shared.options
    }
}
