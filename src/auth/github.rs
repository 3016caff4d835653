use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::{AuthResult, Authenticator};
use crate::client::VaultClient;
use crate::error::Result;

const LOGIN_PATH: &str = "auth/github/login";

#[derive(Serialize)]
struct LoginBody<'a> {
    token: &'a str,
}

/// Logs in with a GitHub personal access token.
pub struct GitHubLogin {
    token: SecretString,
}

impl GitHubLogin {
    pub(crate) const METHOD: &'static str = "github";

    pub fn new(token: SecretString) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Authenticator for GitHubLogin {
    async fn authenticate(&self, client: &VaultClient) -> Result<AuthResult> {
        tracing::debug!(address = client.address(), "authenticating using GitHub");
        let body = LoginBody {
            token: self.token.expose_secret(),
        };
        client.login(LOGIN_PATH, &body).await
    }

    fn method(&self) -> &'static str {
        Self::METHOD
    }
}
