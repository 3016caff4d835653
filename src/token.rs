//! The manager's one authentication token.
//!
//! [`TokenLifecycle`] can only be built from a successful first
//! authentication, so a token is always published. If the grant is renewable
//! it re-authenticates in the background every time the lease runs out. A
//! failed renewal keeps the old token published and retries with backoff.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tokio::time::Instant;
use tracing::Instrument;

use crate::auth::{AuthResult, Authenticator};
use crate::error::Result;
use crate::manager::Background;
use crate::report::Origin;

struct Published {
    token: SecretString,
    renewable: bool,
    lease_duration: Duration,
    issued_at: DateTime<Utc>,
}

impl From<&AuthResult> for Published {
    fn from(result: &AuthResult) -> Self {
        Self {
            token: result.client_token().clone(),
            renewable: result.renewable(),
            lease_duration: result.lease_duration(),
            issued_at: result.issued_at(),
        }
    }
}

/// Point-in-time view of the token, without the token itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStatus {
    pub method: &'static str,
    pub renewable: bool,
    pub lease_duration: Duration,
    pub issued_at: DateTime<Utc>,
    /// Successful background renewals so far.
    pub renewals: u64,
    /// Renewal failures since the last success.
    pub consecutive_failures: u32,
    /// Whether the renewal loop is still running.
    pub renewing: bool,
}

pub struct TokenLifecycle {
    method: &'static str,
    current: Mutex<Published>,
    renewals: AtomicU64,
    failures: AtomicU32,
    renewing: AtomicBool,
}

impl TokenLifecycle {
    fn new(method: &'static str, first: &AuthResult) -> Self {
        Self {
            method,
            current: Mutex::new(Published::from(first)),
            renewals: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            renewing: AtomicBool::new(false),
        }
    }

    /// Authenticate once and, for renewable grants, start the renewal loop.
    ///
    /// A failure here is returned to the caller and nothing is spawned.
    pub(crate) async fn start(
        authenticator: Arc<dyn Authenticator>,
        background: &Background,
    ) -> Result<Arc<Self>> {
        let method = authenticator.method();
        tracing::info!(method, "starting token lifecycle");

        let first = authenticator.authenticate(&background.client).await?;
        let lifecycle = Arc::new(Self::new(method, &first));
        tracing::info!(
            method = lifecycle.method,
            renewable = first.renewable(),
            lease_secs = first.lease_duration().as_secs(),
            "first token acquired"
        );

        if first.renewable() {
            lifecycle.renewing.store(true, Ordering::SeqCst);
            let span = tracing::info_span!("token_renewal", method = lifecycle.method);
            background.tracker.spawn(
                lifecycle
                    .clone()
                    .renew(authenticator, background.clone(), first)
                    .instrument(span),
            );
        }

        Ok(lifecycle)
    }

    /// The most recently published token.
    pub fn token(&self) -> SecretString {
        self.lock().token.clone()
    }

    pub fn status(&self) -> TokenStatus {
        let published = self.lock();
        TokenStatus {
            method: self.method,
            renewable: published.renewable,
            lease_duration: published.lease_duration,
            issued_at: published.issued_at,
            renewals: self.renewals.load(Ordering::Relaxed),
            consecutive_failures: self.failures.load(Ordering::Relaxed),
            renewing: self.renewing.load(Ordering::SeqCst),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Published> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, result: &AuthResult) {
        *self.lock() = Published::from(result);
    }

    async fn renew(
        self: Arc<Self>,
        authenticator: Arc<dyn Authenticator>,
        background: Background,
        first: AuthResult,
    ) {
        let Background {
            client,
            reporter,
            policy,
            cancel,
            ..
        } = background;
        let mut backoff = policy.backoff();
        let mut deadline = first.issued() + policy.schedule(first.lease_duration());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {}
            }

            tracing::debug!("renewing token");
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = authenticator.authenticate(&client) => outcome,
            };

            match outcome {
                Ok(result) => {
                    backoff.reset();
                    self.failures.store(0, Ordering::Relaxed);
                    self.publish(&result);
                    self.renewals.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        lease_secs = result.lease_duration().as_secs(),
                        "token renewed"
                    );

                    if !result.renewable() {
                        tracing::info!("renewed token is not renewable; stopping renewal");
                        break;
                    }
                    deadline = result.issued() + policy.schedule(result.lease_duration());
                }
                Err(error) => {
                    let delay = backoff.next_delay();
                    self.failures.store(backoff.failures(), Ordering::Relaxed);
                    reporter.report(Origin::Token, error);
                    deadline = Instant::now() + delay;
                }
            }
        }

        self.renewing.store(false, Ordering::SeqCst);
        tracing::debug!("token renewal stopped");
    }
}
