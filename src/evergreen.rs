//! Background refresh for renewable secrets.
//!
//! An [`EvergreenSecret`] starts from a snapshot that was just fetched and
//! re-reads the same path each time the lease runs out. Readers always see a
//! complete snapshot: the refresh swaps one `Arc` for another, and a failed
//! refresh leaves the previous value in place.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::Instant;
use tracing::Instrument;

use crate::manager::Background;
use crate::report::Origin;
use crate::secret::{SecretData, SecretSnapshot};
use crate::token::TokenLifecycle;

pub struct EvergreenSecret {
    path: String,
    current: Mutex<Arc<SecretSnapshot>>,
    refreshes: AtomicU64,
    running: AtomicBool,
}

impl EvergreenSecret {
    /// Wrap `snapshot` and start refreshing it in the background.
    pub(crate) fn spawn(
        snapshot: SecretSnapshot,
        token: Arc<TokenLifecycle>,
        background: &Background,
    ) -> Arc<Self> {
        let secret = Arc::new(Self {
            path: snapshot.path.clone(),
            current: Mutex::new(Arc::new(snapshot)),
            refreshes: AtomicU64::new(0),
            running: AtomicBool::new(true),
        });

        let span = tracing::info_span!("evergreen_refresh", path = %secret.path);
        background
            .tracker
            .spawn(secret.clone().run(token, background.clone()).instrument(span));
        secret
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The latest successfully fetched snapshot.
    pub fn current(&self) -> Arc<SecretSnapshot> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// A copy of the latest payload.
    pub fn get(&self) -> SecretData {
        self.current().data.clone()
    }

    /// Successful refreshes since the first fetch.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Whether the refresh loop is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn replace(&self, snapshot: SecretSnapshot) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    async fn run(self: Arc<Self>, token: Arc<TokenLifecycle>, background: Background) {
        let Background {
            client,
            reporter,
            policy,
            cancel,
            ..
        } = background;
        let mut backoff = policy.backoff();
        let mut deadline = {
            let first = self.current();
            first.fetched + policy.schedule(first.lease_duration)
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            tracing::debug!("refreshing secret");
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = async {
                    let token = token.token();
                    client.read_secret(&self.path, &token).await
                } => outcome,
            };

            match outcome {
                Ok(snapshot) => {
                    backoff.reset();
                    let renewable = snapshot.renewable;
                    deadline = snapshot.fetched + policy.schedule(snapshot.lease_duration);
                    tracing::debug!(
                        lease_secs = snapshot.lease_duration.as_secs(),
                        "secret refreshed"
                    );
                    self.replace(snapshot);
                    self.refreshes.fetch_add(1, Ordering::Relaxed);

                    if !renewable {
                        tracing::info!("secret is no longer renewable; stopping refresh");
                        break;
                    }
                }
                Err(error) => {
                    let delay = backoff.next_delay();
                    reporter.report(Origin::Secret(self.path.clone()), error);
                    deadline = Instant::now() + delay;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::debug!("secret refresh stopped");
    }
}

impl std::fmt::Debug for EvergreenSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvergreenSecret")
            .field("path", &self.path)
            .field("refreshes", &self.refreshes())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
