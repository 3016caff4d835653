//! HTTP plumbing for talking to Vault.
//!
//! Every request goes through [`VaultClient`], which owns the base address and
//! maps responses onto [`VaultError`]: network failures become `Transport`,
//! 401/403 become `Authorization`, any other non-2xx becomes
//! `UnexpectedStatus`, and bodies that fail to parse become `Decode`.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::auth::AuthResult;
use crate::error::{Result, VaultError};
use crate::secret::{SecretResponse, SecretSnapshot};

const TOKEN_HEADER: &str = "X-Vault-Token";

/// Vault's standard error body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    auth: Option<LoginAuth>,
}

#[derive(Debug, Deserialize)]
struct LoginAuth {
    client_token: String,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    lease_duration: u64,
}

/// A Vault endpoint plus the HTTP client used to reach it.
#[derive(Debug, Clone)]
pub struct VaultClient {
    http: Client,
    address: String,
}

impl VaultClient {
    pub fn new(address: impl Into<String>, http: Client) -> Self {
        let address = address.into().trim_end_matches('/').to_string();
        Self { http, address }
    }

    /// Build a client with its own connection pool and a per-request timeout.
    pub fn with_timeout(address: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build().map_err(|e| {
            VaultError::Configuration(format!("failed to build http client: {e}"))
        })?;
        Ok(Self::new(address, http))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// `{address}/v1/{path}`
    pub fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path.trim_start_matches('/'))
    }

    /// POST a login body to `auth/...` and decode the `auth` block.
    pub async fn login<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<AuthResult> {
        let url = self.url(path);
        let response: LoginResponse = self.send(&url, self.http.post(&url).json(body)).await?;
        auth_result(&url, response)
    }

    /// GET an `auth/...` endpoint whose response carries an `auth` block.
    pub async fn login_get(&self, path: &str, query: &[(&str, &str)]) -> Result<AuthResult> {
        let url = self.url(path);
        let response: LoginResponse = self.send(&url, self.http.get(&url).query(query)).await?;
        auth_result(&url, response)
    }

    /// POST an unauthenticated body and decode the whole response.
    pub async fn write<B, T>(&self, path: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        self.send(&url, self.http.post(&url).json(body)).await
    }

    /// Read the secret at `path` using `token`.
    pub async fn read_secret(&self, path: &str, token: &SecretString) -> Result<SecretSnapshot> {
        let url = self.url(path);
        let request = self
            .http
            .get(&url)
            .header(TOKEN_HEADER, token.expose_secret());
        let body: SecretResponse = self.send(&url, request).await?;
        SecretSnapshot::from_response(path, &url, body)
    }

    async fn send<T: DeserializeOwned>(&self, url: &str, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(|source| VaultError::Transport {
            url: url.to_string(),
            source,
        })?;
        decode_response(url, response).await
    }
}

async fn decode_response<T: DeserializeOwned>(url: &str, response: Response) -> Result<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|source| VaultError::Transport {
            url: url.to_string(),
            source,
        })?;

    if !status.is_success() {
        let message = error_message(&body);
        return Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VaultError::Authorization {
                url: url.to_string(),
                status,
                message,
            },
            _ => VaultError::UnexpectedStatus {
                url: url.to_string(),
                status,
                message,
            },
        });
    }

    serde_json::from_str(&body).map_err(|e| VaultError::decode(url, e))
}

fn auth_result(url: &str, response: LoginResponse) -> Result<AuthResult> {
    let auth = response
        .auth
        .ok_or_else(|| VaultError::shape(url, "response carried no auth block"))?;
    if auth.client_token.is_empty() {
        return Err(VaultError::shape(url, "auth block carried an empty client_token"));
    }
    Ok(AuthResult::new(
        SecretString::from(auth.client_token),
        auth.renewable,
        Duration::from_secs(auth.lease_duration),
    ))
}

/// Pull the server's reason out of an error body, falling back to the raw text.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed.errors.join("; "),
        _ if body.trim().is_empty() => "empty response body".to_string(),
        _ => body.trim().to_string(),
    }
}
