use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::auth::{AuthMethod, OidcSettings, DEFAULT_JWT_PATH};
use crate::backoff::RefreshPolicy;
use crate::duration::deserialize_duration;
use crate::error::{Result, VaultError};

/// Default capacity of the background error channel.
fn default_error_buffer() -> usize {
    64
}

/// Default per-request HTTP timeout (30 seconds).
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_google_credentials_file() -> PathBuf {
    PathBuf::from("google-credentials.json")
}

/// Manager configuration, built once and handed to
/// [`SecretsManager`](crate::manager::SecretsManager).
///
/// ```toml
/// address = "https://vault.internal:8200"
/// request_timeout = "10s"
///
/// [auth]
/// method = "github"
/// token = "ghp_..."
///
/// [refresh]
/// retry_initial = "1s"
/// retry_max = "5m"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the Vault server, e.g. `https://vault.internal:8200`.
    pub address: String,

    /// How to obtain the token.
    pub auth: AuthMethod,

    /// Refresh and retry timing.
    #[serde(default)]
    pub refresh: RefreshPolicy,

    /// Undelivered background errors kept before new ones are dropped.
    #[serde(default = "default_error_buffer")]
    pub error_buffer: usize,

    #[serde(
        default = "default_request_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub request_timeout: Duration,

    /// Where `set_default_google_credentials` writes the decoded key.
    #[serde(default = "default_google_credentials_file")]
    pub google_credentials_file: PathBuf,
}

impl Config {
    /// A config with default timing for `address` and `auth`.
    pub fn new(address: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            address: address.into(),
            auth,
            refresh: RefreshPolicy::default(),
            error_buffer: default_error_buffer(),
            request_timeout: default_request_timeout(),
            google_credentials_file: default_google_credentials_file(),
        }
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Build a config from the process environment.
    ///
    /// `VAULT_ADDR` is required. The method is picked from the first of
    /// `VAULT_TOKEN`, `GITHUB_TOKEN`, or `MOUNT_PATH` plus `ROLE` that is set;
    /// `JWT_PATH` overrides the service-account token location.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Config::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let address = var("VAULT_ADDR")
            .ok_or_else(|| VaultError::Configuration("VAULT_ADDR is not set".to_string()))?;

        let auth = if let Some(token) = var("VAULT_TOKEN") {
            AuthMethod::Token {
                token: SecretString::from(token),
            }
        } else if let Some(token) = var("GITHUB_TOKEN") {
            AuthMethod::GitHub {
                token: SecretString::from(token),
            }
        } else if let (Some(mount), Some(role)) = (var("MOUNT_PATH"), var("ROLE")) {
            AuthMethod::Kubernetes {
                mount,
                role,
                jwt_path: var("JWT_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_JWT_PATH)),
            }
        } else {
            return Err(VaultError::Configuration(
                "no authentication configured: set VAULT_TOKEN, GITHUB_TOKEN, or MOUNT_PATH and ROLE"
                    .to_string(),
            ));
        };

        Ok(Self::new(address, auth))
    }

    /// An OIDC config whose address comes from `VAULT_ADDR`.
    pub fn oidc_from_env(settings: OidcSettings) -> Result<Self> {
        let address = std::env::var("VAULT_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| VaultError::Configuration("VAULT_ADDR is not set".to_string()))?;
        Ok(Self::new(address, AuthMethod::Oidc(settings)))
    }

    /// Check the config before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.address).map_err(|e| {
            VaultError::Configuration(format!("invalid address {:?}: {e}", self.address))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(VaultError::Configuration(format!(
                "address {:?} must use http or https",
                self.address
            )));
        }

        match &self.auth {
            AuthMethod::Token { token } | AuthMethod::GitHub { token } => {
                if token.expose_secret().trim().is_empty() {
                    return Err(VaultError::Configuration(format!(
                        "{} auth requires a non-empty token",
                        self.auth.name()
                    )));
                }
            }
            AuthMethod::Kubernetes { mount, role, .. } => {
                if mount.trim_matches('/').is_empty() || role.trim().is_empty() {
                    return Err(VaultError::Configuration(
                        "kubernetes auth requires both mount and role".to_string(),
                    ));
                }
            }
            AuthMethod::Oidc(settings) => {
                if settings.mount.trim_matches('/').is_empty() {
                    return Err(VaultError::Configuration(
                        "oidc auth requires a mount".to_string(),
                    ));
                }
            }
        }

        if self.error_buffer == 0 {
            return Err(VaultError::Configuration(
                "error_buffer must be at least 1".to_string(),
            ));
        }
        if self.refresh.retry_initial.is_zero() || self.refresh.min_interval.is_zero() {
            return Err(VaultError::Configuration(
                "refresh.retry_initial and refresh.min_interval must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Returns the default config file path.
///
/// Resolution order:
/// 1. `./evergreen-vault.toml` if it exists in current directory
/// 2. `~/.config/evergreen-vault/config.toml` (XDG config directory)
pub fn default_config_path() -> PathBuf {
    let local_config = PathBuf::from("evergreen-vault.toml");
    if local_config.exists() {
        return local_config;
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("evergreen-vault").join("config.toml");
    }

    local_config
}
