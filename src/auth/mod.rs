//! Authentication against Vault.
//!
//! An [`Authenticator`] turns one credential source into an [`AuthResult`].
//! It performs at most one login round trip and never retries; retry policy
//! belongs to [`crate::token::TokenLifecycle`], which calls it.
//!
//! The configured method is an explicit [`AuthMethod`] variant:
//!
//! ```toml
//! [auth]
//! method = "kubernetes"
//! mount = "kubernetes/runtimeservice/team/app"
//! role = "app"
//! ```

mod github;
mod kubernetes;
pub mod oidc;

pub use github::GitHubLogin;
pub use kubernetes::{KubernetesLogin, DEFAULT_JWT_PATH};
pub use oidc::{BrowserOpener, LogBrowserOpener, OidcLogin, OidcSettings};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use tokio::time::{Instant, Sleep};

use crate::client::VaultClient;
use crate::error::Result;

/// A freshly issued Vault token.
#[derive(Debug, Clone)]
pub struct AuthResult {
    client_token: SecretString,
    renewable: bool,
    lease_duration: Duration,
    issued: Instant,
    issued_at: DateTime<Utc>,
}

impl AuthResult {
    pub fn new(client_token: SecretString, renewable: bool, lease_duration: Duration) -> Self {
        Self {
            client_token,
            renewable,
            lease_duration,
            issued: Instant::now(),
            issued_at: Utc::now(),
        }
    }

    pub fn client_token(&self) -> &SecretString {
        &self.client_token
    }

    pub fn renewable(&self) -> bool {
        self.renewable
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Completes once, `lease_duration` after issuance.
    ///
    /// Irrelevant for non-renewable results, which are never rescheduled.
    pub fn expiry(&self) -> Sleep {
        tokio::time::sleep_until(self.issued + self.lease_duration)
    }

    pub(crate) fn issued(&self) -> Instant {
        self.issued
    }
}

/// Produces a token from one credential source.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Perform one login. Must not retry.
    async fn authenticate(&self, client: &VaultClient) -> Result<AuthResult>;

    /// Short name used in logs.
    fn method(&self) -> &'static str;
}

/// How the manager should authenticate.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "method", rename_all = "lowercase")]
pub enum AuthMethod {
    /// A pre-issued token, used as-is and never renewed.
    Token {
        #[serde(deserialize_with = "deserialize_secret")]
        token: SecretString,
    },
    /// GitHub personal access token login.
    #[serde(rename = "github")]
    GitHub {
        #[serde(deserialize_with = "deserialize_secret")]
        token: SecretString,
    },
    /// Kubernetes service-account login.
    Kubernetes {
        mount: String,
        role: String,
        #[serde(default = "default_jwt_path")]
        jwt_path: PathBuf,
    },
    /// Interactive OIDC login completed in a browser.
    Oidc(OidcSettings),
}

fn default_jwt_path() -> PathBuf {
    PathBuf::from(DEFAULT_JWT_PATH)
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::Token { .. } => StaticToken::METHOD,
            AuthMethod::GitHub { .. } => GitHubLogin::METHOD,
            AuthMethod::Kubernetes { .. } => KubernetesLogin::METHOD,
            AuthMethod::Oidc(_) => OidcLogin::METHOD,
        }
    }

    /// Build the authenticator for this method.
    pub fn authenticator(&self) -> Arc<dyn Authenticator> {
        match self {
            AuthMethod::Token { token } => Arc::new(StaticToken::new(token.clone())),
            AuthMethod::GitHub { token } => Arc::new(GitHubLogin::new(token.clone())),
            AuthMethod::Kubernetes {
                mount,
                role,
                jwt_path,
            } => Arc::new(KubernetesLogin::new(mount, role, jwt_path)),
            AuthMethod::Oidc(settings) => Arc::new(OidcLogin::new(settings.clone())),
        }
    }
}

/// A pre-issued token. Never touches the network and is never renewed.
pub struct StaticToken {
    token: SecretString,
}

impl StaticToken {
    const METHOD: &'static str = "token";

    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Authenticator for StaticToken {
    async fn authenticate(&self, _client: &VaultClient) -> Result<AuthResult> {
        Ok(AuthResult::new(self.token.clone(), false, Duration::ZERO))
    }

    fn method(&self) -> &'static str {
        Self::METHOD
    }
}
