use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::backend::{Completion, EventLoop};
use super::errors::{RabbitMQError, Result};
use super::latch::PendingLatch;

/// Options for blocking calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Wall-clock bound on one blocking call. `None` waits forever.
    pub operation_timeout: Option<Duration>,
}

impl SyncOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            operation_timeout: Some(timeout),
        }
    }
}

/// Turn one callback-completed request into a blocking call.
///
/// `initiate` receives the completion callback and issues the request. The
/// loop is then driven on this thread until the callback has fired.
pub fn sync_await<L, T, W, F>(driver: &L, watch: W, timeout: Option<Duration>, initiate: F) -> Result<T>
where
    L: EventLoop + ?Sized,
    T: 'static,
    W: Fn() -> Result<()>,
    F: FnOnce(Completion<T>),
{
    let latch = PendingLatch::new();
    initiate(latch.completion());
    drive_until(driver, watch, timeout, &latch)
}

/// Poll `driver` until `latch` is filled.
///
/// `watch` runs before every poll, so an unexpected close dispatched by the
/// previous poll is returned instead of polling again.
pub fn drive_until<L, T, W>(
    driver: &L,
    watch: W,
    timeout: Option<Duration>,
    latch: &PendingLatch<T>,
) -> Result<T>
where
    L: EventLoop + ?Sized,
    W: Fn() -> Result<()>,
{
    let deadline = timeout.map(|limit| (limit, Instant::now() + limit));
    let mut polls: u64 = 0;

    loop {
        watch()?;

        if let Some(value) = latch.take() {
            trace!(polls, "Operation completed");
            return Ok(value);
        }

        if let Some((limit, at)) = deadline {
            if Instant::now() >= at {
                debug!(polls, ?limit, "Operation timed out");
                return Err(RabbitMQError::Timeout(limit));
            }
        }

        driver.poll_once();
        polls += 1;
    }
}
