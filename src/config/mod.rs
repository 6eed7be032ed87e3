//! # Configuration Management
//!
//! Bootstrap configuration is read once from the environment (after `.env`
//! loading in `main`), overridden by CLI flags, validated, and then passed
//! explicitly to the controller, the publisher and the readiness gate.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{Error, Result};
use crate::publisher::CredentialRegistry;
use crate::retry::RetryPolicy;
use crate::store::HttpStoreConfig;

pub const ENV_STORE_ADDR: &str = "VAULT_ADDR";
pub const ENV_NAMESPACE: &str = "VAULT_NAMESPACE";
pub const ENV_KV_MOUNT: &str = "VAULT_KV_MOUNT";
pub const ENV_STATE_DIR: &str = "VAULT_BOOTSTRAP_STATE_DIR";
pub const ENV_POLICY_NAME: &str = "VAULT_BOOTSTRAP_POLICY";
pub const ENV_CREDENTIAL_PREFIX: &str = "VAULT_BOOTSTRAP_CREDENTIAL_PREFIX";
pub const ENV_APP_TOKEN_FILE: &str = "VAULT_BOOTSTRAP_APP_TOKEN_FILE";
pub const ENV_REQUEST_TIMEOUT: &str = "VAULT_BOOTSTRAP_REQUEST_TIMEOUT_SECS";
pub const ENV_WAIT_ATTEMPTS: &str = "VAULT_BOOTSTRAP_WAIT_ATTEMPTS";
pub const ENV_WAIT_INTERVAL_MS: &str = "VAULT_BOOTSTRAP_WAIT_INTERVAL_MS";
pub const ENV_CALL_ATTEMPTS: &str = "VAULT_BOOTSTRAP_RETRY_ATTEMPTS";
pub const ENV_CALL_BACKOFF_MS: &str = "VAULT_BOOTSTRAP_RETRY_BACKOFF_MS";

const DEFAULT_STORE_ADDR: &str = "http://vault:8200";
const DEFAULT_KV_MOUNT: &str = "kv";
const DEFAULT_STATE_DIR: &str = "/var/lib/vault-bootstrap";
const DEFAULT_POLICY_NAME: &str = "app-policy";

/// Bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BootstrapConfig {
    /// Secret store address
    #[validate(url(message = "Store address must be a valid URL"))]
    pub store_address: String,

    /// Optional namespace header
    pub namespace: Option<String>,

    /// KV v2 mount holding the credential records
    #[validate(length(min = 1, max = 128, message = "KV mount cannot be empty"))]
    pub kv_mount: String,

    /// Directory holding the persisted bootstrap state
    pub state_dir: PathBuf,

    /// Name of the read-only application policy
    #[validate(length(min = 1, max = 128, message = "Policy name cannot be empty"))]
    pub policy_name: String,

    /// Prefix below the KV mount for the credential records; the
    /// application policy reads exactly this subtree ("" for the whole mount)
    pub credential_prefix: String,

    /// Where to export the scoped application token, if anywhere
    pub app_token_file: Option<PathBuf>,

    /// Per-request timeout in seconds
    #[validate(range(min = 1, max = 300, message = "Request timeout must be 1-300 seconds"))]
    pub request_timeout_secs: u64,

    /// Retry policy for waiting on the store to accept connections
    #[validate(nested)]
    pub wait_retry: RetryPolicy,

    /// Retry policy for every other remote call
    #[validate(nested)]
    pub call_retry: RetryPolicy,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            store_address: DEFAULT_STORE_ADDR.to_string(),
            namespace: None,
            kv_mount: DEFAULT_KV_MOUNT.to_string(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            policy_name: DEFAULT_POLICY_NAME.to_string(),
            credential_prefix: String::new(),
            app_token_file: None,
            request_timeout_secs: 10,
            wait_retry: RetryPolicy::fixed(30, Duration::from_secs(1)),
            call_retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(200),
                max_backoff: Duration::from_secs(5),
                backoff_multiplier: 2.0,
            },
        }
    }
}

impl BootstrapConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let wait_attempts = parse_var(&var, ENV_WAIT_ATTEMPTS, defaults.wait_retry.max_attempts)?;
        let wait_interval_ms = parse_var(
            &var,
            ENV_WAIT_INTERVAL_MS,
            defaults.wait_retry.initial_backoff.as_millis() as u64,
        )?;
        let call_attempts = parse_var(&var, ENV_CALL_ATTEMPTS, defaults.call_retry.max_attempts)?;
        let call_backoff_ms = parse_var(
            &var,
            ENV_CALL_BACKOFF_MS,
            defaults.call_retry.initial_backoff.as_millis() as u64,
        )?;

        Ok(Self {
            store_address: var(ENV_STORE_ADDR).unwrap_or(defaults.store_address),
            namespace: var(ENV_NAMESPACE),
            kv_mount: var(ENV_KV_MOUNT).unwrap_or(defaults.kv_mount),
            state_dir: var(ENV_STATE_DIR).map(PathBuf::from).unwrap_or(defaults.state_dir),
            policy_name: var(ENV_POLICY_NAME).unwrap_or(defaults.policy_name),
            credential_prefix: var(ENV_CREDENTIAL_PREFIX).unwrap_or_default(),
            app_token_file: var(ENV_APP_TOKEN_FILE).map(PathBuf::from),
            request_timeout_secs: parse_var(
                &var,
                ENV_REQUEST_TIMEOUT,
                defaults.request_timeout_secs,
            )?,
            wait_retry: RetryPolicy::fixed(wait_attempts, Duration::from_millis(wait_interval_ms)),
            call_retry: RetryPolicy {
                max_attempts: call_attempts,
                initial_backoff: Duration::from_millis(call_backoff_ms),
                ..defaults.call_retry
            },
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(|e| Error::config(e.to_string()))?;

        if self.kv_mount.trim_matches('/').contains('/') {
            return Err(Error::config(format!(
                "KV mount '{}' must be a single path segment",
                self.kv_mount
            )));
        }

        if !self.policy_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(Error::config(format!(
                "Policy name '{}' may only contain letters, digits, '-' and '_'",
                self.policy_name
            )));
        }

        Ok(())
    }

    pub fn http_store_config(&self) -> HttpStoreConfig {
        HttpStoreConfig {
            address: self.store_address.clone(),
            namespace: self.namespace.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }

    pub fn registry(&self) -> CredentialRegistry {
        CredentialRegistry::with_mount(self.kv_mount.trim_matches('/'))
            .with_prefix(&self.credential_prefix)
    }
}

fn parse_var<V, T>(var: &V, name: &str, default: T) -> Result<T>
where
    V: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid value for {}: '{}' ({})", name, raw, e))),
        None => Ok(default),
    }
}
