//! Interactive OIDC login.
//!
//! The flow mirrors the Vault CLI: ask Vault for an authorization URL bound
//! to a local redirect URI, hand that URL to the user's browser, wait for the
//! identity provider to redirect back with `code` and `state`, then exchange
//! them at Vault's callback endpoint for a token.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use rand::distributions::{Alphanumeric, DistString};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use super::{AuthResult, Authenticator};
use crate::client::VaultClient;
use crate::duration::deserialize_duration;
use crate::error::{Result, VaultError};

const CALLBACK_PATH: &str = "/oidc/callback";
const NONCE_LEN: usize = 20;

fn default_timeout() -> Duration {
    Duration::from_secs(120)
}

/// Settings for the local callback listener and the Vault OIDC mount.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OidcSettings {
    /// Auth mount the OIDC method is enabled at.
    pub mount: String,
    /// Vault role to log in as. Empty uses the mount's default role.
    pub role: String,
    /// Address the callback listener binds to.
    pub listen_address: String,
    /// Port the callback listener binds to. `0` picks a free port.
    pub port: u16,
    /// Host written into the redirect URI.
    pub callback_host: String,
    /// Scheme written into the redirect URI.
    pub callback_method: String,
    /// Port written into the redirect URI, when it differs from the bound port
    /// (e.g. behind a port forward).
    pub callback_port: Option<u16>,
    /// How long to wait for the browser to come back.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for OidcSettings {
    fn default() -> Self {
        Self {
            mount: "oidc".to_string(),
            role: String::new(),
            listen_address: "localhost".to_string(),
            port: 8250,
            callback_host: "localhost".to_string(),
            callback_method: "http".to_string(),
            callback_port: None,
            timeout: default_timeout(),
        }
    }
}

/// Presents the authorization URL to the user.
#[async_trait]
pub trait BrowserOpener: Send + Sync {
    async fn open(&self, auth_url: &str) -> Result<()>;
}

/// Logs the authorization URL so the user can open it manually.
pub struct LogBrowserOpener;

#[async_trait]
impl BrowserOpener for LogBrowserOpener {
    async fn open(&self, auth_url: &str) -> Result<()> {
        tracing::info!(url = auth_url, "complete the OIDC login in a browser");
        Ok(())
    }
}

#[derive(Serialize)]
struct AuthUrlRequest<'a> {
    role: &'a str,
    redirect_uri: &'a str,
    client_nonce: &'a str,
}

#[derive(Deserialize)]
struct AuthUrlResponse {
    #[serde(default)]
    data: Option<AuthUrlData>,
}

#[derive(Deserialize)]
struct AuthUrlData {
    #[serde(default)]
    auth_url: String,
}

/// What the identity provider sent back to the redirect URI.
#[derive(Debug, PartialEq, Eq)]
struct Callback {
    code: String,
    state: String,
}

/// Browser-based OIDC login.
pub struct OidcLogin {
    settings: OidcSettings,
    opener: Arc<dyn BrowserOpener>,
}

impl OidcLogin {
    pub(crate) const METHOD: &'static str = "oidc";

    pub fn new(settings: OidcSettings) -> Self {
        Self {
            settings,
            opener: Arc::new(LogBrowserOpener),
        }
    }

    pub fn with_opener(mut self, opener: Arc<dyn BrowserOpener>) -> Self {
        self.opener = opener;
        self
    }

    fn mount(&self) -> &str {
        self.settings.mount.trim_matches('/')
    }

    fn redirect_uri(&self, bound_port: u16) -> String {
        let port = self.settings.callback_port.unwrap_or(bound_port);
        format!(
            "{}://{}:{}{}",
            self.settings.callback_method, self.settings.callback_host, port, CALLBACK_PATH
        )
    }

    async fn fetch_auth_url(
        &self,
        client: &VaultClient,
        redirect_uri: &str,
        client_nonce: &str,
    ) -> Result<String> {
        let request = AuthUrlRequest {
            role: &self.settings.role,
            redirect_uri,
            client_nonce,
        };
        let response: AuthUrlResponse = client
            .write(&format!("auth/{}/oidc/auth_url", self.mount()), &request)
            .await?;

        match response.data {
            Some(data) if !data.auth_url.is_empty() => Ok(data.auth_url),
            _ => Err(VaultError::OidcCallback(format!(
                "unable to authorize role {:?} with redirect_uri {:?}; check the Vault logs",
                self.settings.role, redirect_uri
            ))),
        }
    }
}

#[async_trait]
impl Authenticator for OidcLogin {
    async fn authenticate(&self, client: &VaultClient) -> Result<AuthResult> {
        let bind = (self.settings.listen_address.as_str(), self.settings.port);
        let listener = TcpListener::bind(bind).await.map_err(|e| {
            VaultError::OidcCallback(format!(
                "failed to listen on {}:{}: {e}",
                self.settings.listen_address, self.settings.port
            ))
        })?;
        let bound_port = listener
            .local_addr()
            .map_err(|e| VaultError::OidcCallback(format!("callback listener has no address: {e}")))?
            .port();

        let redirect_uri = self.redirect_uri(bound_port);
        let client_nonce = Alphanumeric.sample_string(&mut rand::thread_rng(), NONCE_LEN);

        tracing::debug!(
            address = client.address(),
            mount = self.mount(),
            redirect_uri = %redirect_uri,
            "authenticating using OIDC"
        );
        let auth_url = self
            .fetch_auth_url(client, &redirect_uri, &client_nonce)
            .await?;
        self.opener.open(&auth_url).await?;

        let callback = wait_for_callback(listener, self.settings.timeout).await?;

        client
            .login_get(
                &format!("auth/{}/oidc/callback", self.mount()),
                &[
                    ("state", callback.state.as_str()),
                    ("code", callback.code.as_str()),
                    ("client_nonce", client_nonce.as_str()),
                ],
            )
            .await
    }

    fn method(&self) -> &'static str {
        Self::METHOD
    }
}

type Outcome = std::result::Result<Callback, String>;

/// Query parameters the identity provider appends to the redirect URI.
#[derive(Debug, Default, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackQuery {
    fn into_outcome(self) -> Outcome {
        if let Some(error) = self.error_description.or(self.error) {
            return Err(error);
        }
        match (self.code, self.state) {
            (Some(code), Some(state)) => Ok(Callback { code, state }),
            _ => Err("callback is missing code or state".to_string()),
        }
    }
}

/// Hands the first callback back to the waiting login.
#[derive(Clone)]
struct CallbackState {
    sender: Arc<Mutex<Option<oneshot::Sender<Outcome>>>>,
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(query): Query<CallbackQuery>,
) -> (StatusCode, String) {
    let outcome = query.into_outcome();
    let response = match &outcome {
        Ok(_) => (
            StatusCode::OK,
            "Vault login complete, you can close this window.".to_string(),
        ),
        Err(reason) => (
            StatusCode::BAD_REQUEST,
            format!("Vault login failed: {reason}"),
        ),
    };

    let sender = state
        .sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match sender {
        Some(sender) => {
            let _ = sender.send(outcome);
        }
        None => tracing::debug!("ignoring repeated OIDC callback"),
    }
    response
}

/// Serve the callback route on `listener` until the first callback arrives
/// or `timeout` passes.
async fn wait_for_callback(listener: TcpListener, timeout: Duration) -> Result<Callback> {
    let (sender, receiver) = oneshot::channel();
    let (stop, stopped) = oneshot::channel::<()>();

    let router = Router::new()
        .route(CALLBACK_PATH, get(handle_callback))
        .with_state(CallbackState {
            sender: Arc::new(Mutex::new(Some(sender))),
        });
    tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = stopped.await;
            })
            .await;
        if let Err(err) = served {
            tracing::warn!(error = %err, "OIDC callback listener failed");
        }
    });

    let outcome = tokio::time::timeout(timeout, receiver).await;
    let _ = stop.send(());

    match outcome {
        Err(_) => Err(VaultError::OidcCallback(format!(
            "no browser callback within {}",
            crate::duration::format_duration(timeout)
        ))),
        Ok(Err(_)) => Err(VaultError::OidcCallback(
            "callback listener stopped before the browser returned".to_string(),
        )),
        Ok(Ok(outcome)) => outcome.map_err(VaultError::OidcCallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    fn query(pairs: &[(&str, &str)]) -> CallbackQuery {
        let mut query = CallbackQuery::default();
        for (key, value) in pairs {
            let value = Some(value.to_string());
            match *key {
                "code" => query.code = value,
                "state" => query.state = value,
                "error" => query.error = value,
                "error_description" => query.error_description = value,
                _ => {}
            }
        }
        query
    }

    #[test]
    fn test_callback_outcome() {
        assert_eq!(
            query(&[("code", "abc"), ("state", "st_1")]).into_outcome(),
            Ok(Callback {
                code: "abc".to_string(),
                state: "st_1".to_string(),
            })
        );
        assert_eq!(
            query(&[("state", "st_1")]).into_outcome(),
            Err("callback is missing code or state".to_string())
        );
        assert_eq!(
            query(&[("error", "access_denied")]).into_outcome(),
            Err("access_denied".to_string())
        );
        assert_eq!(
            query(&[
                ("error", "access_denied"),
                ("error_description", "user cancelled"),
            ])
            .into_outcome(),
            Err("user cancelled".to_string())
        );
    }

    async fn local_listener() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_idle_connection_does_not_block_callback() {
        let (listener, addr) = local_listener().await;

        // A browser preconnect that never sends a request.
        let _idle = TcpStream::connect(addr).await.unwrap();

        let browser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let response =
                reqwest::get(format!("http://{addr}/oidc/callback?code=abc&state=st_1"))
                    .await
                    .unwrap();
            response.status()
        });

        let callback = wait_for_callback(listener, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            callback,
            Callback {
                code: "abc".to_string(),
                state: "st_1".to_string(),
            }
        );
        assert_eq!(browser.await.unwrap(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_other_paths_are_not_found_and_errors_are_returned() {
        let (listener, addr) = local_listener().await;

        let browser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let http = reqwest::Client::new();
            let favicon = http
                .get(format!("http://{addr}/favicon.ico"))
                .send()
                .await
                .unwrap()
                .status();
            let callback = http
                .get(format!(
                    "http://{addr}/oidc/callback?error=access_denied&error_description=user%20cancelled"
                ))
                .send()
                .await
                .unwrap()
                .status();
            (favicon, callback)
        });

        let err = wait_for_callback(listener, Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            VaultError::OidcCallback(reason) => assert_eq!(reason, "user cancelled"),
            other => panic!("unexpected error {other:?}"),
        }

        let (favicon, callback) = browser.await.unwrap();
        assert_eq!(favicon, reqwest::StatusCode::NOT_FOUND);
        assert_eq!(callback, reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_no_callback_times_out() {
        let (listener, _addr) = local_listener().await;
        let err = wait_for_callback(listener, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no browser callback within"));
    }

    #[test]
    fn test_redirect_uri() {
        let login = OidcLogin::new(OidcSettings::default());
        assert_eq!(login.redirect_uri(8250), "http://localhost:8250/oidc/callback");

        let login = OidcLogin::new(OidcSettings {
            callback_method: "https".to_string(),
            callback_host: "dev.local".to_string(),
            callback_port: Some(443),
            ..OidcSettings::default()
        });
        assert_eq!(login.redirect_uri(50123), "https://dev.local:443/oidc/callback");
    }

    #[test]
    fn test_settings_defaults_from_empty_table() {
        let settings: OidcSettings = toml::from_str("role = \"dev\"").unwrap();
        assert_eq!(settings.mount, "oidc");
        assert_eq!(settings.role, "dev");
        assert_eq!(settings.port, 8250);
        assert_eq!(settings.timeout, Duration::from_secs(120));
    }
}
