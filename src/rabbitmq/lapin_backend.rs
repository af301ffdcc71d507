//! `lapin` behind the callback-driven collaborator traits.
//!
//! lapin resolves its requests as futures on its own I/O threads. Here every
//! request is spawned as a local task on a current-thread tokio runtime, and
//! the task invokes the completion callback when the future resolves. The
//! runtime only makes progress inside [`LapinEventLoop::poll_once`], so every
//! callback runs on the thread that drives the loop.
//!
//! Connection errors reported by lapin's `on_error` hook arrive on a foreign
//! thread. They are forwarded over an unbounded channel to a local task and
//! dispatched as close notifications from `poll_once` too, along the same path
//! as ordinary completions.
//!
//! A failed channel request carries the broker's reply code and is reported
//! with it. A channel the broker closes while nothing is pending is noticed by
//! a local task that checks the channel status once per poll interval; lapin
//! keeps no reply code for that case, so it is reported as `CHANNEL_ERROR`.

use std::cell::{Cell, OnceCell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use lapin::options::{
    BasicCancelOptions, ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, Notify};
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

use super::backend::{
    ChannelNumber, CloseCallback, Completion, Connector, EventLoop, QueueDeclareOk, RawChannel,
    RawConnection, ReplyCode,
};
use super::errors::Result;

/// Reported for failures that carry no broker reply (I/O, invalid state).
pub const INTERNAL_ERROR: ReplyCode = 541;

/// Reported when a request reaches a channel or connection that never opened.
pub const CHANNEL_ERROR: ReplyCode = 504;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

type CloseHook = Rc<dyn Fn(ReplyCode, &str)>;

const CLOSED_BY_BROKER: &str = "CHANNEL_ERROR - channel closed by broker";

/// Reply code and text for a lapin error.
pub fn reply_of(error: &lapin::Error) -> (ReplyCode, String) {
    match error {
        lapin::Error::ProtocolError(amqp) => {
            (amqp.get_id(), amqp.get_message().as_str().to_owned())
        }
        other => (INTERNAL_ERROR, other.to_string()),
    }
}

/// Strip credentials from an AMQP URI.
pub fn redact_uri(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://{}", &uri[..scheme_end], &uri[at + 1..])
        }
        _ => uri.to_string(),
    }
}

pub struct LapinEventLoop {
    tasks: LocalSet,
    runtime: Runtime,
    wakeup: Rc<Notify>,
    poll_interval: Duration,
}

impl LapinEventLoop {
    pub fn new(poll_interval: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_time().build()?;
        Ok(Self {
            tasks: LocalSet::new(),
            runtime,
            wakeup: Rc::new(Notify::new()),
            poll_interval,
        })
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let wakeup = Rc::clone(&self.wakeup);
        self.tasks.spawn_local(async move {
            task.await;
            wakeup.notify_one();
        });
    }
}

impl EventLoop for LapinEventLoop {
    /// Runs spawned tasks until one of them finishes or the poll interval
    /// elapses, whichever is first.
    fn poll_once(&self) {
        let wakeup = Rc::clone(&self.wakeup);
        let interval = self.poll_interval;
        self.runtime.block_on(self.tasks.run_until(async move {
            let _ = tokio::time::timeout(interval, wakeup.notified()).await;
        }));
    }
}

pub struct LapinConnector {
    uri: String,
    properties: ConnectionProperties,
    poll_interval: Duration,
}

impl LapinConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            properties: ConnectionProperties::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_properties(mut self, properties: ConnectionProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl Connector for LapinConnector {
    type Connection = LapinConnection;

    fn params(&self) -> String {
        redact_uri(&self.uri)
    }

    fn connect(self, on_open: Completion<()>, on_close: CloseCallback) -> Result<LapinConnection> {
        let event_loop = Rc::new(LapinEventLoop::new(self.poll_interval)?);
        let slot: Rc<OnceCell<Connection>> = Rc::new(OnceCell::new());
        let on_close: CloseHook = Rc::from(on_close);
        let (errors_tx, mut errors_rx) = mpsc::unbounded_channel::<lapin::Error>();

        let notify_close = Rc::clone(&on_close);
        event_loop.spawn(async move {
            if let Some(err) = errors_rx.recv().await {
                let (code, text) = reply_of(&err);
                notify_close(code, &text);
            }
        });

        let uri = self.uri;
        let params = redact_uri(&uri);
        let properties = self.properties;
        let opened = Rc::clone(&slot);
        let failed = Rc::clone(&on_close);
        event_loop.spawn(async move {
            match Connection::connect(&uri, properties).await {
                Ok(connection) => {
                    connection.on_error(move |err| {
                        let _ = errors_tx.send(err);
                    });
                    if opened.set(connection).is_err() {
                        warn!(%params, "Connection slot already filled");
                    }
                    debug!(%params, "AMQP handshake completed");
                    on_open(());
                }
                Err(err) => {
                    let (code, text) = reply_of(&err);
                    error!(%params, code, %text, "Failed to connect to RabbitMQ");
                    failed(code, &text);
                }
            }
        });

        Ok(LapinConnection {
            event_loop,
            connection: slot,
            on_close,
            closing: Rc::new(Cell::new(false)),
        })
    }
}

pub struct LapinConnection {
    event_loop: Rc<LapinEventLoop>,
    connection: Rc<OnceCell<Connection>>,
    on_close: CloseHook,
    closing: Rc<Cell<bool>>,
}

impl RawConnection for LapinConnection {
    type Loop = LapinEventLoop;
    type Channel = LapinChannel;

    fn event_loop(&self) -> Rc<LapinEventLoop> {
        Rc::clone(&self.event_loop)
    }

    fn channel(&self, on_open: Completion<()>) -> LapinChannel {
        let channel = LapinChannel {
            event_loop: Rc::clone(&self.event_loop),
            channel: Rc::new(OnceCell::new()),
            close_hooks: CloseHooks::default(),
            closing: ClosingFlags {
                connection: Rc::clone(&self.closing),
                channel: Rc::new(Cell::new(false)),
            },
        };

        let connection = Rc::clone(&self.connection);
        let slot = Rc::clone(&channel.channel);
        let hooks = channel.close_hooks.clone();
        let closing = channel.closing.clone();
        let interval = self.event_loop.poll_interval;
        self.event_loop.spawn(async move {
            let Some(connection) = connection.get() else {
                hooks.fire(CHANNEL_ERROR, "CHANNEL_ERROR - connection is not open");
                return;
            };
            match connection.create_channel().await {
                Ok(created) => {
                    let id = created.id();
                    debug!(channel = id, "Channel created");
                    let watched = created.clone();
                    if slot.set(created).is_err() {
                        warn!("Channel slot already filled");
                    }
                    on_open(());

                    while watched.status().connected() && !closing.requested() {
                        tokio::time::sleep(interval).await;
                    }
                    if !closing.requested() {
                        warn!(channel = id, "Channel closed by broker");
                        hooks.fire(CHANNEL_ERROR, CLOSED_BY_BROKER);
                    }
                }
                Err(err) => {
                    let (code, text) = reply_of(&err);
                    warn!(code, %text, "Failed to create channel");
                    hooks.fire(code, &text);
                }
            }
        });

        channel
    }

    fn close(&self, reply_code: ReplyCode, reply_text: &str, done: Completion<()>) {
        self.closing.set(true);
        let connection = Rc::clone(&self.connection);
        let on_close = Rc::clone(&self.on_close);
        let reply_text = reply_text.to_owned();
        self.event_loop.spawn(async move {
            let Some(connection) = connection.get() else {
                done(());
                return;
            };
            match connection.close(reply_code, &reply_text).await {
                Ok(()) => {
                    info!(reply_code, "Connection close acknowledged");
                    done(());
                }
                Err(err) => {
                    let (code, text) = reply_of(&err);
                    on_close(code, &text);
                }
            }
        });
    }
}

#[derive(Clone, Default)]
struct CloseHooks(Rc<RefCell<Vec<CloseHook>>>);

impl CloseHooks {
    fn add(&self, hook: CloseCallback) {
        self.0.borrow_mut().push(Rc::from(hook));
    }

    fn fire(&self, code: ReplyCode, text: &str) {
        let hooks = self.0.borrow().clone();
        for hook in hooks {
            hook(code, text);
        }
    }
}

/// Closes requested from this side. A channel that stops being connected
/// after one of these is not reported as closed by the broker.
#[derive(Clone, Default)]
struct ClosingFlags {
    connection: Rc<Cell<bool>>,
    channel: Rc<Cell<bool>>,
}

impl ClosingFlags {
    fn requested(&self) -> bool {
        self.connection.get() || self.channel.get()
    }
}

pub struct LapinChannel {
    event_loop: Rc<LapinEventLoop>,
    channel: Rc<OnceCell<Channel>>,
    close_hooks: CloseHooks,
    closing: ClosingFlags,
}

impl LapinChannel {
    /// Spawn one lapin request. A failed request kills the channel on the
    /// broker side, so it is reported through the close hooks.
    fn request<T, R, Fut>(&self, operation: &'static str, request: R, done: Completion<T>)
    where
        T: 'static,
        R: FnOnce(Channel) -> Fut + 'static,
        Fut: Future<Output = lapin::Result<T>> + 'static,
    {
        let slot = Rc::clone(&self.channel);
        let hooks = self.close_hooks.clone();
        self.event_loop.spawn(async move {
            let Some(channel) = slot.get().cloned() else {
                hooks.fire(CHANNEL_ERROR, "CHANNEL_ERROR - channel is not open");
                return;
            };
            let id = channel.id();
            match request(channel).await {
                Ok(value) => done(value),
                Err(err) => {
                    let (code, text) = reply_of(&err);
                    warn!(channel = id, operation, code, %text, "Channel request failed");
                    hooks.fire(code, &text);
                }
            }
        });
    }
}

impl RawChannel for LapinChannel {
    fn channel_number(&self) -> ChannelNumber {
        self.channel.get().map(|channel| channel.id()).unwrap_or(0)
    }

    fn add_on_close_callback(&self, callback: CloseCallback) {
        self.close_hooks.add(callback);
    }

    fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
        done: Completion<QueueDeclareOk>,
    ) {
        let queue = queue.to_owned();
        self.request(
            "queue.declare",
            move |channel| async move {
                channel
                    .queue_declare(&queue, options, arguments)
                    .await
                    .map(|declared| QueueDeclareOk {
                        queue: declared.name().as_str().to_owned(),
                        message_count: declared.message_count(),
                        consumer_count: declared.consumer_count(),
                    })
            },
            done,
        );
    }

    fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
        done: Completion<()>,
    ) {
        let exchange = exchange.to_owned();
        self.request(
            "exchange.declare",
            move |channel| async move {
                channel
                    .exchange_declare(&exchange, kind, options, arguments)
                    .await
            },
            done,
        );
    }

    fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
        done: Completion<()>,
    ) {
        let (queue, exchange, routing_key) =
            (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
        self.request(
            "queue.bind",
            move |channel| async move {
                channel
                    .queue_bind(&queue, &exchange, &routing_key, options, arguments)
                    .await
            },
            done,
        );
    }

    fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeBindOptions,
        arguments: FieldTable,
        done: Completion<()>,
    ) {
        let (destination, source, routing_key) =
            (destination.to_owned(), source.to_owned(), routing_key.to_owned());
        self.request(
            "exchange.bind",
            move |channel| async move {
                channel
                    .exchange_bind(&destination, &source, &routing_key, options, arguments)
                    .await
            },
            done,
        );
    }

    fn queue_delete(&self, queue: &str, options: QueueDeleteOptions, done: Completion<u32>) {
        let queue = queue.to_owned();
        self.request(
            "queue.delete",
            move |channel| async move { channel.queue_delete(&queue, options).await },
            done,
        );
    }

    fn exchange_delete(&self, exchange: &str, options: ExchangeDeleteOptions, done: Completion<()>) {
        let exchange = exchange.to_owned();
        self.request(
            "exchange.delete",
            move |channel| async move { channel.exchange_delete(&exchange, options).await },
            done,
        );
    }

    fn basic_cancel(&self, consumer_tag: &str, options: BasicCancelOptions) {
        let Some(channel) = self.channel.get().cloned() else {
            warn!(consumer_tag, "Cannot cancel consumer on a channel that is not open");
            return;
        };
        let consumer_tag = consumer_tag.to_owned();
        self.event_loop.spawn(async move {
            if let Err(err) = channel.basic_cancel(&consumer_tag, options).await {
                warn!(%consumer_tag, error = %err, "Failed to cancel consumer");
            }
        });
    }

    fn close(&self, reply_code: ReplyCode, reply_text: &str, done: Completion<()>) {
        self.closing.channel.set(true);
        let reply_text = reply_text.to_owned();
        self.request(
            "channel.close",
            move |channel| async move { channel.close(reply_code, &reply_text).await },
            done,
        );
    }
}
