//! Cancellation and deadlines for a single request

use crate::errors::ServerError;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, time::Instant};

/// Carries the caller's cancellation signal and deadline through an operation
///
/// Clones share the same cancellation state, so any clone may cancel the
/// request for all of them.
#[derive(Clone, Debug)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Arc<watch::Sender<bool>>,
    cancelled: watch::Receiver<bool>,
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        let (cancel, cancelled) = watch::channel(false);
        Context {
            deadline: None,
            cancel: Arc::new(cancel),
            cancelled,
        }
    }

    /// A context that expires after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Context::background().deadline_at(Instant::now() + timeout)
    }

    /// A child sharing this context's cancellation, with a deadline no later
    /// than `deadline`
    pub fn deadline_at(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Context {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
            cancelled: self.cancelled.clone(),
        }
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The reason this context is done, if it is
    pub fn err(&self) -> Option<ServerError> {
        if *self.cancelled.borrow() {
            Some(ServerError::Cancelled)
        } else if matches!(self.deadline, Some(deadline) if Instant::now() >= deadline) {
            Some(ServerError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Check the context, as a `Result`
    pub fn check(&self) -> Result<(), ServerError> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes
    pub async fn done(&self) {
        let mut cancelled = self.cancelled.clone();
        let cancellation = async move {
            loop {
                if *cancelled.borrow() {
                    return;
                }
                if cancelled.changed().await.is_err() {
                    futures_util::future::pending::<()>().await;
                }
            }
        };
        match self.deadline {
            None => cancellation.await,
            Some(deadline) => tokio::select! {
                _ = cancellation => {},
                _ = tokio::time::sleep_until(deadline) => {},
            },
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::background()
    }
}
