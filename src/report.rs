//! Reporting background failures to the owner of the manager.
//!
//! Background loops cannot return errors to anyone, so they push them onto a
//! bounded channel. Pushing never waits: if the owner is not draining and the
//! buffer is full, the newest error is dropped and counted. Every error is
//! also logged, so nothing disappears silently.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::VaultError;

/// Which background loop failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Token,
    Secret(String),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Token => write!(f, "token renewal"),
            Origin::Secret(path) => write!(f, "refresh of {path}"),
        }
    }
}

/// A failure from a background refresh.
#[derive(Debug, thiserror::Error)]
#[error("{origin} failed: {error}")]
pub struct BackgroundError {
    pub origin: Origin,
    #[source]
    pub error: VaultError,
    pub at: DateTime<Utc>,
}

/// Sending half, cloned into every background loop.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<BackgroundError>,
    dropped: Arc<AtomicU64>,
}

/// Receiving half, handed to the owner of the manager.
#[derive(Debug)]
pub struct ErrorReceiver {
    rx: mpsc::Receiver<BackgroundError>,
    dropped: Arc<AtomicU64>,
}

/// Create a reporter/receiver pair holding at most `capacity` undelivered errors.
pub fn channel(capacity: usize) -> (ErrorReporter, ErrorReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        ErrorReporter {
            tx,
            dropped: dropped.clone(),
        },
        ErrorReceiver { rx, dropped },
    )
}

impl ErrorReporter {
    pub fn report(&self, origin: Origin, error: VaultError) {
        tracing::warn!(origin = %origin, error = %error, "background refresh failed");

        let report = BackgroundError {
            origin,
            error,
            at: Utc::now(),
        };
        match self.tx.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    origin = %report.origin,
                    dropped,
                    "error channel full; dropping report"
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

impl ErrorReceiver {
    /// Wait for the next background error.
    ///
    /// Returns `None` once the manager has been dropped and every loop has exited.
    pub async fn recv(&mut self) -> Option<BackgroundError> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BackgroundError> {
        self.rx.try_recv().ok()
    }

    /// Errors discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
