//! Installing a Google service-account key held in Vault.
//!
//! The key is stored base64-encoded under one field of a secret. It is decoded,
//! written to disk, and `GOOGLE_APPLICATION_CREDENTIALS` is pointed at the file
//! so Google client libraries in this process pick it up.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::error::{Result, VaultError};
use crate::secret::SecretData;

pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Decode the base64 value at `data[key]`.
pub fn decode_key(path: &str, data: &SecretData, key: &str) -> Result<Vec<u8>> {
    let value = data.get(key).ok_or_else(|| VaultError::MissingKey {
        path: path.to_string(),
        key: key.to_string(),
    })?;
    let Value::String(encoded) = value else {
        return Err(VaultError::NotAString {
            path: path.to_string(),
            key: key.to_string(),
        });
    };
    STANDARD
        .decode(encoded.trim())
        .map_err(|source| VaultError::Base64 {
            path: path.to_string(),
            key: key.to_string(),
            source,
        })
}

/// Write `contents` to `file` and export it as the default Google credentials.
///
/// Returns the absolute path that was exported.
pub async fn install(file: &Path, contents: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| VaultError::Io {
                action: "create directory",
                path: parent.to_path_buf(),
                source,
            })?;
    }

    tokio::fs::write(file, contents)
        .await
        .map_err(|source| VaultError::Io {
            action: "write",
            path: file.to_path_buf(),
            source,
        })?;

    let exported = std::path::absolute(file).map_err(|source| VaultError::Io {
        action: "resolve",
        path: file.to_path_buf(),
        source,
    })?;
    std::env::set_var(CREDENTIALS_ENV, &exported);
    tracing::info!(path = %exported.display(), "installed google application credentials");
    Ok(exported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn data(value: Value) -> SecretData {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_decode_key_errors_are_distinct() {
        let secret = data(json!({ "key": "eyJhIjoxfQ==", "n": 5, "bad": "%%%" }));

        assert_eq!(decode_key("kv/gcp", &secret, "key").unwrap(), br#"{"a":1}"#);
        assert!(matches!(
            decode_key("kv/gcp", &secret, "missing"),
            Err(VaultError::MissingKey { .. })
        ));
        assert!(matches!(
            decode_key("kv/gcp", &secret, "n"),
            Err(VaultError::NotAString { .. })
        ));
        assert!(matches!(
            decode_key("kv/gcp", &secret, "bad"),
            Err(VaultError::Base64 { .. })
        ));
    }

    #[tokio::test]
    async fn test_install_writes_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("nested").join("google-credentials.json");

        let exported = install(&file, br#"{"type":"service_account"}"#).await.unwrap();

        assert!(exported.is_absolute());
        let written = std::fs::read_to_string(&file).unwrap();
        assert_eq!(written, r#"{"type":"service_account"}"#);
        assert_eq!(std::env::var_os(CREDENTIALS_ENV), Some(exported.into_os_string()));
    }
}
