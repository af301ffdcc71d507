use std::cell::RefCell;
use std::fmt;
use std::ptr;
use std::rc::{Rc, Weak};

use tracing::{debug, error, info, warn};

use super::backend::{ChannelNumber, ReplyCode};
use super::errors::{RabbitMQError, Result};

/// Reply codes treated as a requested, expected close.
pub const NORMAL_CLOSE_CODES: [ReplyCode; 2] = [0, 200];

/// AMQP `REPLY_SUCCESS`, sent when we close something ourselves.
pub const REPLY_SUCCESS: ReplyCode = 200;

pub fn is_normal_close(code: ReplyCode) -> bool {
    NORMAL_CLOSE_CODES.contains(&code)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: ReplyCode,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseState {
    Connecting,
    Open,
    ClosedNormally,
    ClosedUnexpectedly(CloseReason),
}

/// What a lifecycle belongs to; used to build error messages.
#[derive(Debug, Clone)]
pub enum Subject {
    Connection { params: String },
    Channel { number: ChannelNumber, params: String },
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::Connection { params } => write!(f, "Connection {}", params),
            Subject::Channel { number, params } => {
                write!(f, "Channel {} of connection {}", number, params)
            }
        }
    }
}

/// Close-state of a connection or channel, shared with its close handler.
pub struct Lifecycle {
    subject: RefCell<Subject>,
    state: RefCell<CloseState>,
}

impl Lifecycle {
    pub fn new(subject: Subject) -> Self {
        Self {
            subject: RefCell::new(subject),
            state: RefCell::new(CloseState::Connecting),
        }
    }

    pub fn subject(&self) -> Subject {
        self.subject.borrow().clone()
    }

    /// Channel numbers are only final once the broker has opened the channel.
    pub fn set_channel_number(&self, channel: ChannelNumber) {
        if let Subject::Channel { number, .. } = &mut *self.subject.borrow_mut() {
            *number = channel;
        }
    }

    pub fn state(&self) -> CloseState {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.borrow(), CloseState::Open)
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.state.borrow(), CloseState::ClosedUnexpectedly(_))
    }

    pub fn mark_open(&self) {
        let mut state = self.state.borrow_mut();
        if matches!(*state, CloseState::Connecting) {
            *state = CloseState::Open;
            debug!(subject = %self.subject.borrow(), "Marked open");
        }
    }

    pub fn mark_closed(&self) {
        let mut state = self.state.borrow_mut();
        if !matches!(*state, CloseState::ClosedUnexpectedly(_)) {
            *state = CloseState::ClosedNormally;
        }
    }

    /// Close handler body. Normal codes only record the close; anything else
    /// records a failure that [`Lifecycle::check`] turns into an error.
    pub fn on_close(&self, code: ReplyCode, text: &str) {
        let mut state = self.state.borrow_mut();
        if matches!(*state, CloseState::ClosedNormally | CloseState::ClosedUnexpectedly(_)) {
            debug!(subject = %self.subject.borrow(), code, text, "Ignoring repeated close notification");
            return;
        }

        if is_normal_close(code) {
            info!(subject = %self.subject.borrow(), code, text, "Closed normally");
            *state = CloseState::ClosedNormally;
        } else {
            error!(subject = %self.subject.borrow(), code, text, "Closed unexpectedly");
            *state = CloseState::ClosedUnexpectedly(CloseReason {
                code,
                text: text.to_string(),
            });
        }
    }

    /// Error out if an unexpected close has been recorded.
    pub fn check(&self) -> Result<()> {
        match &*self.state.borrow() {
            CloseState::ClosedUnexpectedly(reason) => Err(self.closed_error(reason)),
            _ => Ok(()),
        }
    }

    /// Error out unless a request may still be issued.
    pub fn ensure_usable(&self) -> Result<()> {
        self.check()?;
        match &*self.state.borrow() {
            CloseState::ClosedNormally => {
                warn!(subject = %self.subject.borrow(), "Request on a closed entity");
                Err(RabbitMQError::AlreadyClosed(self.subject.borrow().to_string()))
            }
            _ => Ok(()),
        }
    }

    fn closed_error(&self, reason: &CloseReason) -> RabbitMQError {
        match &*self.subject.borrow() {
            Subject::Connection { params } => RabbitMQError::ConnectionClosed {
                params: params.clone(),
                code: reason.code,
                text: reason.text.clone(),
            },
            Subject::Channel { number, params } => RabbitMQError::ChannelClosed {
                channel: *number,
                params: params.clone(),
                code: reason.code,
                text: reason.text.clone(),
            },
        }
    }
}

/// Lifecycles of the channels opened on one connection.
///
/// Whichever blocking call is driving the loop reports a channel's unexpected
/// close, once. Channels that were dropped or closed normally are forgotten.
#[derive(Default)]
pub struct ChannelLifecycles {
    entries: RefCell<Vec<Weak<Lifecycle>>>,
}

impl ChannelLifecycles {
    pub fn register(&self, lifecycle: &Rc<Lifecycle>) {
        self.entries.borrow_mut().push(Rc::downgrade(lifecycle));
    }

    /// Channels still tracked.
    pub fn len(&self) -> usize {
        self.prune();
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self) {
        self.entries.borrow_mut().retain(|entry| {
            entry
                .upgrade()
                .is_some_and(|lifecycle| lifecycle.state() != CloseState::ClosedNormally)
        });
    }

    /// Return the error of one unexpectedly closed channel and stop tracking
    /// it. `preferred` is reported first when it is among the failures.
    pub fn take_failure(&self, preferred: Option<&Lifecycle>) -> Result<()> {
        self.prune();
        let mut entries = self.entries.borrow_mut();

        let failed: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.upgrade().is_some_and(|lifecycle| lifecycle.is_failed()))
            .map(|(index, _)| index)
            .collect();
        let chosen = failed
            .iter()
            .copied()
            .find(|&index| preferred.is_some_and(|wanted| ptr::eq(entries[index].as_ptr(), wanted)))
            .or_else(|| failed.first().copied());

        match chosen.map(|index| entries.remove(index)).and_then(|entry| entry.upgrade()) {
            Some(lifecycle) => lifecycle.check(),
            None => Ok(()),
        }
    }
}
