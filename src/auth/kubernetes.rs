use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use super::{AuthResult, Authenticator};
use crate::client::VaultClient;
use crate::error::{Result, VaultError};

/// Where Kubernetes projects the pod's service-account token.
pub const DEFAULT_JWT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Serialize)]
struct LoginBody<'a> {
    jwt: &'a str,
    role: &'a str,
}

/// Logs in with the pod's service-account JWT.
///
/// The JWT is re-read on every login since the kubelet rotates the
/// projected token file.
pub struct KubernetesLogin {
    mount: String,
    role: String,
    jwt_path: PathBuf,
}

impl KubernetesLogin {
    pub(crate) const METHOD: &'static str = "kubernetes";

    pub fn new(mount: impl Into<String>, role: impl Into<String>, jwt_path: impl AsRef<Path>) -> Self {
        Self {
            mount: mount.into().trim_matches('/').to_string(),
            role: role.into(),
            jwt_path: jwt_path.as_ref().to_path_buf(),
        }
    }

    fn login_path(&self) -> String {
        format!("auth/{}/login", self.mount)
    }

    async fn read_jwt(&self) -> Result<String> {
        let raw = tokio::fs::read_to_string(&self.jwt_path)
            .await
            .map_err(|source| VaultError::Io {
                action: "read service account token from",
                path: self.jwt_path.clone(),
                source,
            })?;
        let jwt = raw.trim();
        if jwt.is_empty() {
            return Err(VaultError::Configuration(format!(
                "service account token file {} is empty",
                self.jwt_path.display()
            )));
        }
        Ok(jwt.to_string())
    }
}

#[async_trait]
impl Authenticator for KubernetesLogin {
    async fn authenticate(&self, client: &VaultClient) -> Result<AuthResult> {
        tracing::debug!(
            address = client.address(),
            mount = %self.mount,
            role = %self.role,
            "authenticating using Kubernetes"
        );
        let jwt = self.read_jwt().await?;
        let body = LoginBody {
            jwt: &jwt,
            role: &self.role,
        };
        client.login(&self.login_path(), &body).await
    }

    fn method(&self) -> &'static str {
        Self::METHOD
    }
}
