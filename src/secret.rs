//! Fetched secrets and the accessors handed to callers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::error::{Result, VaultError};
use crate::evergreen::EvergreenSecret;

pub type SecretData = Map<String, Value>;

/// Wire shape of `GET /v1/{path}`.
#[derive(Debug, Deserialize)]
pub(crate) struct SecretResponse {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    lease_id: String,
    #[serde(default)]
    renewable: bool,
    #[serde(default)]
    lease_duration: u64,
    #[serde(default)]
    data: Option<SecretData>,
}

/// One fetched version of a secret. Never modified after construction.
#[derive(Debug, Clone)]
pub struct SecretSnapshot {
    pub path: String,
    pub request_id: String,
    pub lease_id: String,
    pub renewable: bool,
    pub lease_duration: Duration,
    pub data: SecretData,
    pub metadata: SecretData,
    pub fetched_at: DateTime<Utc>,
    pub(crate) fetched: Instant,
}

impl SecretSnapshot {
    /// Build a snapshot from a decoded response.
    ///
    /// KV v2 responses wrap the payload as `{"data": {...}, "metadata": {...}}`,
    /// with `metadata` optional. Anything else (KV v1, dynamic secrets) is the
    /// payload itself.
    pub(crate) fn from_response(path: &str, url: &str, response: SecretResponse) -> Result<Self> {
        let mut data = response
            .data
            .ok_or_else(|| VaultError::shape(url, "response carried no data"))?;

        let (payload, metadata) = match data.remove("data") {
            Some(Value::Object(payload)) => {
                let metadata = match data.remove("metadata") {
                    Some(Value::Object(metadata)) => metadata,
                    _ => SecretData::new(),
                };
                (payload, metadata)
            }
            Some(other) => {
                data.insert("data".to_string(), other);
                (data, SecretData::new())
            }
            None => (data, SecretData::new()),
        };

        Ok(Self {
            path: path.to_string(),
            request_id: response.request_id,
            lease_id: response.lease_id,
            renewable: response.renewable,
            lease_duration: Duration::from_secs(response.lease_duration),
            data: payload,
            metadata,
            fetched_at: Utc::now(),
            fetched: Instant::now(),
        })
    }
}

#[derive(Clone)]
enum Source {
    Static(Arc<SecretSnapshot>),
    Evergreen(Arc<EvergreenSecret>),
}

/// Answers with the secret's data as of now.
///
/// Cheap to clone. For a non-renewable secret the answer never changes; for a
/// renewable one it tracks the background refresh, keeping the last good value
/// when a refresh fails.
#[derive(Clone)]
pub struct SecretAccessor {
    source: Source,
}

impl SecretAccessor {
    pub(crate) fn fixed(snapshot: SecretSnapshot) -> Self {
        Self {
            source: Source::Static(Arc::new(snapshot)),
        }
    }

    pub(crate) fn evergreen(secret: Arc<EvergreenSecret>) -> Self {
        Self {
            source: Source::Evergreen(secret),
        }
    }

    /// A copy of the current payload; changing it does not affect the cache.
    pub fn get(&self) -> SecretData {
        self.snapshot().data.clone()
    }

    /// Look up one string field of the current payload.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.snapshot()
            .data
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// The full current snapshot, including lease and metadata.
    pub fn snapshot(&self) -> Arc<SecretSnapshot> {
        match &self.source {
            Source::Static(snapshot) => snapshot.clone(),
            Source::Evergreen(secret) => secret.current(),
        }
    }

    /// Whether a background loop keeps this value fresh.
    pub fn is_evergreen(&self) -> bool {
        matches!(self.source, Source::Evergreen(_))
    }

    /// True when both accessors read from the same underlying value.
    pub fn same_source(&self, other: &SecretAccessor) -> bool {
        match (&self.source, &other.source) {
            (Source::Static(a), Source::Static(b)) => Arc::ptr_eq(a, b),
            (Source::Evergreen(a), Source::Evergreen(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for SecretAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("SecretAccessor")
            .field("path", &snapshot.path)
            .field("evergreen", &self.is_evergreen())
            .field("data", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const URL: &str = "http://vault/v1/kv/data/app";

    fn snapshot(body: Value) -> Result<SecretSnapshot> {
        let response: SecretResponse = serde_json::from_value(body).unwrap();
        SecretSnapshot::from_response("kv/data/app", URL, response)
    }

    #[test]
    fn test_kv2_envelope_is_unwrapped() -> Result<()> {
        let snap = snapshot(json!({
            "request_id": "req-1",
            "lease_id": "",
            "renewable": false,
            "lease_duration": 0,
            "data": {
                "data": { "instrumentation-key": "abc" },
                "metadata": { "version": 2 }
            }
        }))?;

        assert_eq!(snap.request_id, "req-1");
        assert_eq!(snap.data.get("instrumentation-key"), Some(&json!("abc")));
        assert_eq!(snap.metadata.get("version"), Some(&json!(2)));
        assert!(!snap.renewable);
        Ok(())
    }

    #[test]
    fn test_kv2_envelope_without_metadata_is_unwrapped() -> Result<()> {
        let snap = snapshot(json!({
            "renewable": true,
            "lease_duration": 60,
            "data": { "data": { "user": "app", "password": "pw" } }
        }))?;

        assert_eq!(snap.data.len(), 2);
        assert_eq!(snap.data.get("user"), Some(&json!("app")));
        assert!(!snap.data.contains_key("data"));
        assert!(snap.metadata.is_empty());
        Ok(())
    }

    #[test]
    fn test_flat_payload_is_kept_whole() -> Result<()> {
        let snap = snapshot(json!({
            "lease_id": "database/creds/app/abc",
            "renewable": true,
            "lease_duration": 3600,
            "data": { "username": "v-app-1", "password": "pw", "data": "not an envelope" }
        }))?;

        assert_eq!(snap.lease_id, "database/creds/app/abc");
        assert_eq!(snap.lease_duration, Duration::from_secs(3600));
        assert_eq!(snap.data.len(), 3);
        assert!(snap.metadata.is_empty());
        Ok(())
    }

    #[test]
    fn test_null_data_is_a_decode_error() {
        let err = snapshot(json!({ "renewable": false, "data": null })).unwrap_err();
        assert!(matches!(err, VaultError::Decode { .. }));
    }

    #[test]
    fn test_fixed_accessor_hands_out_copies() -> Result<()> {
        let accessor = SecretAccessor::fixed(snapshot(json!({
            "data": { "data": { "k": "v" }, "metadata": {} }
        }))?);

        let mut copy = accessor.get();
        copy.insert("k".to_string(), json!("changed"));

        assert_eq!(accessor.get_str("k").as_deref(), Some("v"));
        assert!(!accessor.is_evergreen());
        assert!(accessor.same_source(&accessor.clone()));
        assert!(!format!("{accessor:?}").contains("\"v\""));
        Ok(())
    }
}
