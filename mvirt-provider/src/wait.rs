//! Drift-poll waiter.
//!
//! Repeatedly reads a remote object at a fixed interval until a predicate
//! holds, the timeout elapses or the caller cancels. A failing poll ends the
//! wait immediately.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::debug;

use crate::client::StoreError;

/// Outcome of a single poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Poll<T> {
    Found(T),
    NotFound,
}

impl<T> Poll<T> {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Poll::NotFound)
    }

    pub fn found(self) -> Option<T> {
        match self {
            Poll::Found(t) => Some(t),
            Poll::NotFound => None,
        }
    }
}

impl<T> Poll<T> {
    /// Turn a store read into a poll result, mapping `NotFound` to [`Poll::NotFound`].
    pub fn from_store(result: Result<T, StoreError>) -> Result<Self, StoreError> {
        match result {
            Ok(t) => Ok(Poll::Found(t)),
            Err(e) if e.is_not_found() => Ok(Poll::NotFound),
            Err(e) => Err(e),
        }
    }
}

/// Why a wait ended without the predicate holding.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("poll failed: {0}")]
    Poll(#[source] StoreError),
}

/// Deadlines further out than this are clamped, so huge timeouts never overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Deadline `limit` from now, clamped to [`FAR_FUTURE`].
pub fn deadline_after(limit: Duration) -> Instant {
    Instant::now() + limit.min(FAR_FUTURE)
}

/// Fixed-interval poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Waiter {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Poll until `predicate` holds for a result, returning that result.
    ///
    /// The first poll happens immediately. `cancel` flipping to `true` stops
    /// the wait; dropping its sender does not.
    pub async fn wait_for<T, F, Fut, P>(
        &self,
        mut poll: F,
        predicate: P,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Poll<T>, WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Poll<T>, StoreError>>,
        P: Fn(&Poll<T>) -> bool,
    {
        let deadline = deadline_after(self.timeout);
        let mut attempts = 0u32;

        loop {
            if *cancel.borrow() {
                return Err(WaitError::Cancelled);
            }
            let observed = tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(WaitError::Cancelled),
                _ = sleep_until(deadline) => return Err(WaitError::Timeout(self.timeout)),
                result = poll() => result.map_err(WaitError::Poll)?,
            };
            attempts += 1;

            if predicate(&observed) {
                debug!("Wait condition met after {} polls", attempts);
                return Ok(observed);
            }

            tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(WaitError::Cancelled),
                _ = sleep_until(deadline) => return Err(WaitError::Timeout(self.timeout)),
                _ = sleep(self.interval) => {}
            }
        }
    }

    /// Poll until the object is gone.
    pub async fn wait_until_gone<T, F, Fut>(
        &self,
        poll: F,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), WaitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Poll<T>, StoreError>>,
    {
        self.wait_for(poll, Poll::<T>::is_not_found, cancel)
            .await
            .map(|_| ())
    }
}

/// Resolves once the flag is `true`; never resolves if the sender is dropped first.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
