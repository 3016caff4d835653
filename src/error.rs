//! Error types shared by every part of the engine.

use std::path::PathBuf;

use reqwest::StatusCode;

pub type Result<T, E = VaultError> = std::result::Result<T, E>;

/// Coarse classification of a [`VaultError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid address/credential; fatal at construction.
    Configuration,
    /// Network-level failure or a non-2xx other than 401/403.
    Transport,
    /// Response body did not have the expected shape.
    Decode,
    /// The service rejected the credential or token.
    Authorization,
    /// Local file access failed.
    Io,
    /// A secret field could not be turned into a credential.
    Credential,
}

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} responded with {status}: {message}")]
    UnexpectedStatus {
        url: String,
        status: StatusCode,
        message: String,
    },

    #[error("{url} rejected the request ({status}): {message}")]
    Authorization {
        url: String,
        status: StatusCode,
        message: String,
    },

    #[error("unexpected response from {url}: {reason}")]
    Decode {
        url: String,
        reason: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("failed to {action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key {key} not found in secret {path}")]
    MissingKey { path: String, key: String },

    #[error("key {key} in secret {path} is not a string")]
    NotAString { path: String, key: String },

    #[error("key {key} in secret {path} is not valid base64: {source}")]
    Base64 {
        path: String,
        key: String,
        #[source]
        source: base64::DecodeError,
    },

    #[error("oidc login failed: {0}")]
    OidcCallback(String),
}

impl VaultError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VaultError::Configuration(_) => ErrorKind::Configuration,
            VaultError::Transport { .. } | VaultError::UnexpectedStatus { .. } => {
                ErrorKind::Transport
            }
            VaultError::Authorization { .. } | VaultError::OidcCallback(_) => {
                ErrorKind::Authorization
            }
            VaultError::Decode { .. } => ErrorKind::Decode,
            VaultError::Io { .. } => ErrorKind::Io,
            VaultError::MissingKey { .. }
            | VaultError::NotAString { .. }
            | VaultError::Base64 { .. } => ErrorKind::Credential,
        }
    }

    /// Whether a later attempt at the same request can reasonably succeed.
    ///
    /// Background loops retry regardless; this is for callers deciding what
    /// to do with an error they drained from the channel.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub(crate) fn decode(url: impl Into<String>, source: serde_json::Error) -> Self {
        VaultError::Decode {
            url: url.into(),
            reason: source.to_string(),
            source: Some(source),
        }
    }

    pub(crate) fn shape(url: impl Into<String>, reason: impl Into<String>) -> Self {
        VaultError::Decode {
            url: url.into(),
            reason: reason.into(),
            source: None,
        }
    }
}
