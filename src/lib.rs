//! Keep a Vault token valid and secrets fresh for the lifetime of a process.
//!
//! [`SecretsManager`] authenticates once at construction, renews the token in
//! the background, and hands out [`SecretAccessor`]s that always answer with
//! the latest successfully fetched value of a secret.

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod duration;
pub mod error;
pub mod evergreen;
pub mod google;
pub mod manager;
pub mod report;
pub mod secret;
pub mod token;

pub use auth::{AuthMethod, AuthResult, Authenticator};
pub use config::Config;
pub use error::{ErrorKind, Result, VaultError};
pub use manager::{SecretsManager, SecretsManagerBuilder};
pub use report::{BackgroundError, ErrorReceiver, Origin};
pub use secret::{SecretAccessor, SecretData, SecretSnapshot};
pub use token::TokenStatus;
