#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use evergreen_vault::auth::AuthMethod;
use evergreen_vault::backoff::RefreshPolicy;
use evergreen_vault::{Config, SecretAccessor};
use secrecy::SecretString;
use serde_json::{json, Value};
use wiremock::{Request, Respond, ResponseTemplate};

pub const STATIC_TOKEN: &str = "s.static-token";

/// `{"auth": {...}}` as returned by every login endpoint.
pub fn login_body(token: &str, renewable: bool, lease_secs: u64) -> String {
    json!({
        "request_id": "login-1",
        "auth": {
            "client_token": token,
            "renewable": renewable,
            "lease_duration": lease_secs,
            "policies": ["default"]
        }
    })
    .to_string()
}

/// A KV v2 read response wrapping `data`.
pub fn kv2_body(data: Value, renewable: bool, lease_secs: u64) -> String {
    json!({
        "request_id": "read-1",
        "lease_id": "",
        "renewable": renewable,
        "lease_duration": lease_secs,
        "data": {
            "data": data,
            "metadata": { "version": 1 }
        }
    })
    .to_string()
}

pub fn json_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "application/json")
}

pub fn token_config(address: &str) -> Config {
    Config::new(
        address,
        AuthMethod::Token {
            token: SecretString::from(STATIC_TOKEN.to_string()),
        },
    )
}

pub fn github_config(address: &str, token: &str) -> Config {
    Config::new(
        address,
        AuthMethod::GitHub {
            token: SecretString::from(token.to_string()),
        },
    )
}

/// Short retry timings so failure paths finish quickly.
pub fn fast_refresh(config: &mut Config) {
    config.refresh = RefreshPolicy {
        retry_initial: Duration::from_millis(300),
        retry_max: Duration::from_secs(2),
        min_interval: Duration::from_secs(1),
    };
}

/// Serves `secret-1`, `secret-2`, ... with a one second renewable lease.
#[derive(Clone, Default)]
pub struct CountingSecret {
    served: Arc<AtomicUsize>,
}

impl CountingSecret {
    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

impl Respond for CountingSecret {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        json_response(kv2_body(json!({ "value": format!("secret-{n}") }), true, 1))
    }
}

/// Poll `accessor` until `key` differs from `initial`, or give up after `limit`.
pub async fn wait_for_change(
    accessor: &SecretAccessor,
    key: &str,
    initial: &str,
    limit: Duration,
) -> Result<String> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if let Some(value) = accessor.get_str(key) {
            if value != initial {
                return Ok(value);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("{key} still {initial:?} after {limit:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
