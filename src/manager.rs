//! The public facade: one token, any number of secrets.
//!
//! ```no_run
//! # async fn run() -> evergreen_vault::Result<()> {
//! use evergreen_vault::{Config, SecretsManager};
//!
//! let config = Config::from_env()?;
//! let (manager, mut errors) = SecretsManager::new(config).await?;
//! tokio::spawn(async move {
//!     while let Some(err) = errors.recv().await {
//!         eprintln!("{err}");
//!     }
//! });
//!
//! let db = manager.get_secret("database/creds/app").await?;
//! let password = db.get_str("password");
//! # let _ = password;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::{AuthMethod, Authenticator, BrowserOpener, OidcLogin};
use crate::backoff::RefreshPolicy;
use crate::client::VaultClient;
use crate::config::Config;
use crate::error::{Result, VaultError};
use crate::evergreen::EvergreenSecret;
use crate::google;
use crate::report::{self, ErrorReceiver, ErrorReporter};
use crate::secret::SecretAccessor;
use crate::token::{TokenLifecycle, TokenStatus};

/// What every background loop needs, cloned into each one.
#[derive(Clone)]
pub(crate) struct Background {
    pub client: VaultClient,
    pub reporter: ErrorReporter,
    pub policy: RefreshPolicy,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

/// Filled in once the first renewable fetch for a path succeeds.
type Slot = Arc<tokio::sync::Mutex<Option<SecretAccessor>>>;

struct Inner {
    token: Arc<TokenLifecycle>,
    background: Background,
    shutdown: CancellationToken,
    slots: Mutex<HashMap<String, Slot>>,
    google_credentials_file: PathBuf,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Keeps a Vault token valid and hands out self-refreshing secrets.
///
/// Cheap to clone; clones share the token and the secret cache. Dropping the
/// last clone stops all background loops.
#[derive(Clone)]
pub struct SecretsManager {
    inner: Arc<Inner>,
}

/// Optional overrides for [`SecretsManager`] construction.
pub struct SecretsManagerBuilder {
    config: Config,
    http: Option<reqwest::Client>,
    authenticator: Option<Arc<dyn Authenticator>>,
    browser_opener: Option<Arc<dyn BrowserOpener>>,
}

impl SecretsManagerBuilder {
    /// Use a preconfigured HTTP client instead of building one.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Authenticate with `authenticator` instead of `config.auth`.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Where to send the login URL when `config.auth` is OIDC.
    pub fn browser_opener(mut self, opener: Arc<dyn BrowserOpener>) -> Self {
        self.browser_opener = Some(opener);
        self
    }

    /// Validate the config, authenticate, and start token renewal.
    ///
    /// Fails without starting anything if the config is invalid or the first
    /// authentication fails.
    pub async fn build(self) -> Result<(SecretsManager, ErrorReceiver)> {
        let Self {
            config,
            http,
            authenticator,
            browser_opener,
        } = self;
        config.validate()?;

        let client = match http {
            Some(http) => VaultClient::new(&config.address, http),
            None => VaultClient::with_timeout(&config.address, config.request_timeout)?,
        };
        let authenticator = match (authenticator, &config.auth, browser_opener) {
            (Some(authenticator), _, _) => authenticator,
            (None, AuthMethod::Oidc(settings), Some(opener)) => {
                Arc::new(OidcLogin::new(settings.clone()).with_opener(opener))
            }
            (None, auth, _) => auth.authenticator(),
        };

        let (reporter, receiver) = report::channel(config.error_buffer);
        let shutdown = CancellationToken::new();
        let background = Background {
            client,
            reporter,
            policy: config.refresh,
            cancel: shutdown.child_token(),
            tracker: TaskTracker::new(),
        };

        tracing::info!(
            address = background.client.address(),
            method = authenticator.method(),
            "starting secrets manager"
        );
        let token = TokenLifecycle::start(authenticator, &background).await?;

        let manager = SecretsManager {
            inner: Arc::new(Inner {
                token,
                background,
                shutdown,
                slots: Mutex::new(HashMap::new()),
                google_credentials_file: config.google_credentials_file,
            }),
        };
        Ok((manager, receiver))
    }
}

impl SecretsManager {
    pub fn builder(config: Config) -> SecretsManagerBuilder {
        SecretsManagerBuilder {
            config,
            http: None,
            authenticator: None,
            browser_opener: None,
        }
    }

    /// Build a manager with default HTTP client and the configured auth method.
    ///
    /// Background failures are delivered on the returned receiver; see
    /// [`ErrorReceiver`].
    pub async fn new(config: Config) -> Result<(Self, ErrorReceiver)> {
        Self::builder(config).build().await
    }

    pub fn address(&self) -> &str {
        self.inner.background.client.address()
    }

    /// Fetch the secret at `path` and return an accessor for it.
    ///
    /// A renewable secret is cached and refreshed in the background; later
    /// calls for the same path return the same accessor without a request.
    /// A non-renewable secret is fetched on every call and never refreshed.
    pub async fn get_secret(&self, path: &str) -> Result<SecretAccessor> {
        self.ensure_running()?;
        let path = path.trim_matches('/');
        let slot = self.slot(path);
        let mut slot = slot.lock().await;
        if let Some(accessor) = slot.as_ref() {
            return Ok(accessor.clone());
        }

        let token = self.inner.token.token();
        let snapshot = self
            .inner
            .background
            .client
            .read_secret(path, &token)
            .await?;

        if !snapshot.renewable {
            tracing::debug!(path, "secret is not renewable");
            return Ok(SecretAccessor::fixed(snapshot));
        }

        tracing::info!(
            path,
            lease_secs = snapshot.lease_duration.as_secs(),
            "keeping secret fresh"
        );
        let secret =
            EvergreenSecret::spawn(snapshot, self.inner.token.clone(), &self.inner.background);
        let accessor = SecretAccessor::evergreen(secret);
        *slot = Some(accessor.clone());
        Ok(accessor)
    }

    /// Install the base64 key at `data[key]` of `path` as the default Google
    /// application credentials for this process.
    pub async fn set_default_google_credentials(&self, path: &str, key: &str) -> Result<PathBuf> {
        self.ensure_running()?;
        let path = path.trim_matches('/');
        let token = self.inner.token.token();
        let snapshot = self
            .inner
            .background
            .client
            .read_secret(path, &token)
            .await?;
        let contents = google::decode_key(path, &snapshot.data, key)?;
        google::install(&self.inner.google_credentials_file, &contents).await
    }

    /// The current token.
    pub fn token(&self) -> SecretString {
        self.inner.token.token()
    }

    pub fn token_status(&self) -> TokenStatus {
        self.inner.token.status()
    }

    /// Stop every background loop and wait for them to exit.
    ///
    /// Accessors keep answering with their last value afterwards.
    pub async fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!("shutting down secrets manager");
        }
        self.inner.shutdown.cancel();
        let tracker = &self.inner.background.tracker;
        tracker.close();
        tracker.wait().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(VaultError::Configuration(
                "secrets manager has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    fn slot(&self, path: &str) -> Slot {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_default()
            .clone()
    }
}

impl std::fmt::Debug for SecretsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsManager")
            .field("address", &self.address())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}
