use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::entry::{AttemptError, Entry, Outcome};

/// Error surface of [`RequestFuture::result`].
///
/// `WaitTimeout` is about the caller's own wait; the other variants
/// describe how the request itself ended.
#[derive(Debug, Error, Clone)]
pub enum RetryError {
    /// The caller's wait elapsed before the request completed. The request
    /// is still in flight.
    #[error("wait timed out before the request completed")]
    WaitTimeout,

    /// The request reached its validity deadline before succeeding.
    #[error("request timed out before completing")]
    TimedOut,

    /// The request failed terminally; the last attempt's cause is attached.
    #[error("request failed: {0}")]
    AttemptFailed(AttemptError),

    /// The request was cancelled.
    #[error("request was cancelled")]
    Cancelled,

    /// The service went away without completing the request. Not expected
    /// in a normal lifecycle; shutdown cancels every live entry first.
    #[error("request abandoned by the service")]
    Interrupted,
}

/// Handle returned to the submitter: resolves to the request's result or
/// its typed failure. Signalled exactly once, however the entry exits the
/// pipeline.
pub struct RequestFuture<I, O> {
    entry: Arc<Entry<I, O>>,
}

impl<I, O: Clone> RequestFuture<I, O> {
    pub(crate) fn new(entry: Arc<Entry<I, O>>) -> Self {
        Self { entry }
    }

    /// The original request payload.
    pub fn task(&self) -> &I {
        self.entry.task()
    }

    /// The underlying entry, as observed by listener callbacks.
    pub fn entry(&self) -> &Arc<Entry<I, O>> {
        &self.entry
    }

    /// Request best-effort cancellation; see [`Entry::request_cancellation`].
    pub fn request_cancellation(&self) -> bool {
        self.entry.request_cancellation()
    }

    pub fn is_done(&self) -> bool {
        self.entry.is_done()
    }

    pub fn is_successful(&self) -> bool {
        self.entry.is_successful()
    }

    pub fn is_cancelled(&self) -> bool {
        self.entry.is_cancelled()
    }

    /// Wait up to `timeout_ms` (real time) for the request to complete.
    pub async fn result(&self, timeout_ms: i64) -> Result<O, RetryError> {
        if !self.entry.is_done() {
            let dur = Duration::from_millis(timeout_ms.max(0) as u64);
            match tokio::time::timeout(dur, self.wait_done()).await {
                Err(_) => return Err(RetryError::WaitTimeout),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(())) => {}
            }
        }
        self.take_outcome()
    }

    /// As [`result`](Self::result), but a caller-wait timeout yields
    /// `Ok(None)` instead of an error.
    pub async fn result_opt(&self, timeout_ms: i64) -> Result<Option<O>, RetryError> {
        match self.result(timeout_ms).await {
            Ok(v) => Ok(Some(v)),
            Err(RetryError::WaitTimeout) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Wait without a caller-side bound. The request's own deadline still
    /// applies, so this resolves once the entry goes terminal.
    pub async fn wait(&self) -> Result<O, RetryError> {
        if !self.entry.is_done() {
            self.wait_done().await?;
        }
        self.take_outcome()
    }

    async fn wait_done(&self) -> Result<(), RetryError> {
        let mut rx = self.entry.subscribe_done();
        loop {
            if *rx.borrow_and_update() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                // Sender dropped without completion.
                return Err(RetryError::Interrupted);
            }
        }
    }

    fn take_outcome(&self) -> Result<O, RetryError> {
        match self.entry.outcome() {
            Some(Outcome::Success(v)) => Ok(v),
            Some(Outcome::Failure(Some(cause))) => Err(RetryError::AttemptFailed(cause)),
            Some(Outcome::Failure(None)) => Err(RetryError::AttemptFailed(Arc::new(
                anyhow::anyhow!("final failure with no recorded attempt error"),
            ))),
            Some(Outcome::TimedOut) => Err(RetryError::TimedOut),
            Some(Outcome::Cancelled) => Err(RetryError::Cancelled),
            None => Err(RetryError::Interrupted),
        }
    }
}

impl<I, O> std::fmt::Debug for RequestFuture<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFuture")
            .field("entry", &self.entry)
            .finish()
    }
}
