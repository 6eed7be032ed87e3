//! Secret store client abstraction.
//!
//! [`SecretStore`] is the narrow, typed surface the bootstrap controller,
//! the credential publisher and the readiness gate use to talk to the
//! secret store. Two implementations ship with the crate:
//!
//! - [`HttpSecretStore`]: the store's HTTP API through `vaultrs`
//! - [`InMemorySecretStore`]: an in-process store with fault injection,
//!   used by the test-suite
//!
//! # Authentication
//!
//! There is no ambient authentication. [`SecretStore::login`] validates a
//! token and returns a [`Session`]; every privileged call takes that session
//! explicitly.
//!
//! # Retry contract
//!
//! Implementations report a store that is not accepting connections as
//! [`Error::Unreachable`](crate::errors::Error::Unreachable) and other
//! transient failures as
//! [`Error::RemoteWriteFailed`](crate::errors::Error::RemoteWriteFailed).
//! They never retry internally; callers wrap calls in
//! [`retry`](crate::retry::retry). "Already performed" answers such as a
//! repeated initialization surface as
//! [`Error::AlreadyInitialized`](crate::errors::Error::AlreadyInitialized).

pub mod http;
pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::secrets::SecretString;

pub use http::{HttpSecretStore, HttpStoreConfig};
pub use memory::InMemorySecretStore;

/// Field name to value mapping stored at one secret path.
pub type SecretFields = BTreeMap<String, String>;

/// Store status as reported by a single status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    pub initialized: bool,
    pub sealed: bool,
    /// Unseal shares submitted so far (only meaningful while sealed)
    #[serde(default)]
    pub progress: u32,
    /// Shares required to unseal
    #[serde(default)]
    pub threshold: u32,
}

impl StoreStatus {
    pub fn ready(&self) -> bool {
        self.initialized && !self.sealed
    }
}

/// Output of a successful one-time initialization.
///
/// With a single key share there is exactly one unseal key.
#[derive(Debug, Clone)]
pub struct InitializationResult {
    pub unseal_key: SecretString,
    pub root_token: SecretString,
}

/// An authenticated handle on the store.
#[derive(Debug, Clone)]
pub struct Session {
    token: SecretString,
    policies: Vec<String>,
}

impl Session {
    pub fn new(token: SecretString, policies: Vec<String>) -> Self {
        Self { token, policies }
    }

    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// Policies attached to the session token, as reported by the store.
    pub fn policies(&self) -> &[String] {
        &self.policies
    }

    pub fn is_root(&self) -> bool {
        self.policies.iter().any(|p| p == "root")
    }
}

/// A token restricted to one policy, handed to dependent services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopedToken {
    pub token: SecretString,
    pub policy: String,
}

/// Typed operations on the secret store.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Address used in diagnostics.
    fn address(&self) -> &str;

    /// Report the current initialized/sealed state. Never waits for readiness.
    async fn status(&self) -> Result<StoreStatus>;

    /// Initialize the store, generating `key_shares` unseal keys of which
    /// `key_threshold` are required to unseal.
    async fn initialize(&self, key_shares: u32, key_threshold: u32)
        -> Result<InitializationResult>;

    /// Submit an unseal key; returns the status after submission.
    async fn unseal(&self, key: &SecretString) -> Result<StoreStatus>;

    /// Validate `token` and return a session bound to it.
    async fn login(&self, token: &SecretString) -> Result<Session>;

    /// Enable a KV version 2 engine at `mount`. An existing mount is success.
    async fn enable_kv_mount(&self, session: &Session, mount: &str) -> Result<()>;

    /// Create or overwrite the ACL policy `name`.
    async fn write_policy(&self, session: &Session, name: &str, body: &str) -> Result<()>;

    /// Create a token carrying only `policy`.
    async fn create_token(&self, session: &Session, policy: &str) -> Result<ScopedToken>;

    /// Overwrite the secret at `path` under the KV `mount`.
    async fn write_secret(
        &self,
        session: &Session,
        mount: &str,
        path: &str,
        fields: &SecretFields,
    ) -> Result<()>;

    /// Read the latest version of the secret at `path` under the KV `mount`.
    async fn read_secret(&self, session: &Session, mount: &str, path: &str)
        -> Result<SecretFields>;

    /// Delete the latest version of the secret at `path`. Deleting a path
    /// that holds nothing is success.
    async fn delete_secret(&self, session: &Session, mount: &str, path: &str) -> Result<()>;
}

/// Render the read-only application policy for a KV v2 mount and prefix.
///
/// Grants `read` on the data paths and `list` on the metadata paths below
/// `prefix`, nothing else.
pub fn read_only_policy(mount: &str, prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let scope = if prefix.is_empty() { "*".to_string() } else { format!("{prefix}/*") };
    format!(
        "path \"{mount}/data/{scope}\" {{\n  capabilities = [\"read\"]\n}}\n\n\
         path \"{mount}/metadata/{scope}\" {{\n  capabilities = [\"list\"]\n}}\n"
    )
}

/// Whether the ACL policy `body` grants `capability` on `path`.
///
/// Understands the stanzas [`read_only_policy`] renders: exact paths or a
/// trailing `*` glob, with a `capabilities` list.
pub fn policy_allows(body: &str, path: &str, capability: &str) -> bool {
    let wanted = format!("\"{}\"", capability);
    let mut rest = body;
    while let Some(start) = rest.find("path \"") {
        rest = &rest[start + "path \"".len()..];
        let Some(end) = rest.find('"') else {
            return false;
        };
        let pattern = &rest[..end];
        rest = &rest[end + 1..];

        let block_end = rest.find('}').unwrap_or(rest.len());
        let block = &rest[..block_end];
        rest = &rest[block_end..];

        let matches = match pattern.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == pattern,
        };
        if matches && block.contains(&wanted) {
            return true;
        }
    }
    false
}
