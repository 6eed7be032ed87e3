//! In-process secret store with fault injection.
//!
//! Models the parts of the store the bootstrap flow depends on: the
//! initialized/sealed lifecycle, root and policy-scoped tokens, ACL policies
//! (enforced on reads), KV mounts and secrets. Faults can be scheduled to exercise retry paths:
//! a number of calls that fail as unreachable, or writes that fail
//! transiently.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    policy_allows, InitializationResult, ScopedToken, SecretFields, SecretStore, Session,
    StoreStatus,
};
use crate::errors::{Error, Result};
use crate::secrets::SecretString;

const ROOT_POLICY: &str = "root";

#[derive(Debug, Default)]
struct Inner {
    initialized: bool,
    sealed: bool,
    unseal_key: Option<String>,
    tokens: HashMap<String, Vec<String>>,
    policies: BTreeMap<String, String>,
    mounts: BTreeSet<String>,
    secrets: BTreeMap<(String, String), SecretFields>,
    unreachable_calls: u32,
    /// Per operation: calls to let through, then calls to fail
    unreachable_ops: HashMap<&'static str, (u32, u32)>,
    failing_writes: u32,
    calls: Vec<&'static str>,
}

/// In-memory [`SecretStore`].
#[derive(Debug)]
pub struct InMemorySecretStore {
    address: String,
    inner: Mutex<Inner>,
}

impl Default for InMemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemorySecretStore {
    /// A fresh, uninitialized store.
    pub fn new() -> Self {
        Self {
            address: "memory://secret-store".to_string(),
            inner: Mutex::new(Inner { sealed: true, ..Inner::default() }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-call.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `calls` operations fail as unreachable.
    pub fn fail_unreachable(&self, calls: u32) {
        self.lock().unreachable_calls = calls;
    }

    /// Make the next `calls` invocations of `operation` fail as unreachable.
    pub fn fail_operation(&self, operation: &'static str, calls: u32) {
        self.fail_operation_after(operation, 0, calls);
    }

    /// Let `skip` invocations of `operation` through, then fail the next
    /// `calls` as unreachable.
    pub fn fail_operation_after(&self, operation: &'static str, skip: u32, calls: u32) {
        self.lock().unreachable_ops.insert(operation, (skip, calls));
    }

    /// Make the next `writes` secret writes fail transiently.
    pub fn fail_writes(&self, writes: u32) {
        self.lock().failing_writes = writes;
    }

    /// Seal the store, as a restart of the store process would.
    pub fn seal(&self) {
        self.lock().sealed = true;
    }

    /// Revoke `token`; later logins and calls with it are denied.
    pub fn revoke_token(&self, token: &str) {
        self.lock().tokens.remove(token);
    }

    /// Names of the operations invoked so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    /// How many times `operation` was invoked.
    pub fn call_count(&self, operation: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == operation).count()
    }

    /// Body of the policy `name`, if written.
    pub fn policy(&self, name: &str) -> Option<String> {
        self.lock().policies.get(name).cloned()
    }

    /// Number of policies written.
    pub fn policy_count(&self) -> usize {
        self.lock().policies.len()
    }

    /// Policies attached to `token`, if the store issued it.
    pub fn token_policies(&self, token: &str) -> Option<Vec<String>> {
        self.lock().tokens.get(token).cloned()
    }

    /// Whether a KV engine is mounted at `mount`.
    pub fn has_mount(&self, mount: &str) -> bool {
        self.lock().mounts.contains(mount)
    }

    /// Secret stored at `mount`/`path`, bypassing authentication.
    pub fn secret(&self, mount: &str, path: &str) -> Option<SecretFields> {
        self.lock().secrets.get(&(mount.to_string(), path.to_string())).cloned()
    }

    /// Record the call and apply scheduled unreachability.
    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.calls.push(operation);
        if inner.unreachable_calls > 0 {
            inner.unreachable_calls -= 1;
            return Err(Error::unreachable(&self.address, "connection refused"));
        }
        if let Some((skip, remaining)) = inner.unreachable_ops.get_mut(operation) {
            if *skip > 0 {
                *skip -= 1;
            } else if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::unreachable(&self.address, "connection reset"));
            }
        }
        Ok(inner)
    }
}

impl Inner {
    fn require_unsealed(&self, operation: &str) -> Result<()> {
        if !self.initialized {
            return Err(Error::Rejected {
                operation: operation.to_string(),
                status: 400,
                message: "store is not initialized".to_string(),
            });
        }
        if self.sealed {
            return Err(Error::remote_write_failed(operation, "503: store is sealed"));
        }
        Ok(())
    }

    fn policies_for(&self, operation: &str, session: &Session) -> Result<&Vec<String>> {
        self.tokens.get(session.token().expose_secret()).ok_or_else(|| Error::PermissionDenied {
            operation: operation.to_string(),
            message: "invalid token".to_string(),
        })
    }

    fn require_root(&self, operation: &str, session: &Session) -> Result<()> {
        self.require_unsealed(operation)?;
        if self.policies_for(operation, session)?.iter().any(|p| p == ROOT_POLICY) {
            Ok(())
        } else {
            Err(Error::PermissionDenied {
                operation: operation.to_string(),
                message: "permission denied".to_string(),
            })
        }
    }
}

fn generate_secret(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    fn address(&self) -> &str {
        &self.address
    }

    async fn status(&self) -> Result<StoreStatus> {
        let inner = self.enter("status")?;
        Ok(StoreStatus {
            initialized: inner.initialized,
            sealed: inner.sealed,
            progress: 0,
            threshold: if inner.initialized { 1 } else { 0 },
        })
    }

    async fn initialize(
        &self,
        key_shares: u32,
        key_threshold: u32,
    ) -> Result<InitializationResult> {
        let mut inner = self.enter("initialize")?;
        if inner.initialized {
            return Err(Error::already_initialized("Vault is already initialized"));
        }
        if key_shares != 1 || key_threshold != 1 {
            return Err(Error::Rejected {
                operation: "initialize".to_string(),
                status: 400,
                message: "only a single key share is supported".to_string(),
            });
        }

        let unseal_key = generate_secret("");
        let root_token = generate_secret("s.");
        inner.initialized = true;
        inner.sealed = true;
        inner.unseal_key = Some(unseal_key.clone());
        inner.tokens.insert(root_token.clone(), vec![ROOT_POLICY.to_string()]);

        Ok(InitializationResult {
            unseal_key: SecretString::new(unseal_key),
            root_token: SecretString::new(root_token),
        })
    }

    async fn unseal(&self, key: &SecretString) -> Result<StoreStatus> {
        let mut inner = self.enter("unseal")?;
        if !inner.initialized {
            return Err(Error::Rejected {
                operation: "unseal".to_string(),
                status: 400,
                message: "store is not initialized".to_string(),
            });
        }
        if inner.unseal_key.as_deref() != Some(key.expose_secret()) {
            return Err(Error::Rejected {
                operation: "unseal".to_string(),
                status: 400,
                message: "invalid key".to_string(),
            });
        }
        inner.sealed = false;
        Ok(StoreStatus { initialized: true, sealed: false, progress: 0, threshold: 1 })
    }

    async fn login(&self, token: &SecretString) -> Result<Session> {
        let inner = self.enter("login")?;
        inner.require_unsealed("login")?;
        let policies = inner.tokens.get(token.expose_secret()).cloned().ok_or_else(|| {
            Error::PermissionDenied {
                operation: "login".to_string(),
                message: "invalid token".to_string(),
            }
        })?;
        Ok(Session::new(token.clone(), policies))
    }

    async fn enable_kv_mount(&self, session: &Session, mount: &str) -> Result<()> {
        let mut inner = self.enter("enable_kv_mount")?;
        inner.require_root("enable_kv_mount", session)?;
        inner.mounts.insert(mount.trim_matches('/').to_string());
        Ok(())
    }

    async fn write_policy(&self, session: &Session, name: &str, body: &str) -> Result<()> {
        let mut inner = self.enter("write_policy")?;
        inner.require_root("write_policy", session)?;
        inner.policies.insert(name.to_string(), body.to_string());
        Ok(())
    }

    async fn create_token(&self, session: &Session, policy: &str) -> Result<ScopedToken> {
        let mut inner = self.enter("create_token")?;
        inner.require_root("create_token", session)?;
        if !inner.policies.contains_key(policy) {
            return Err(Error::Rejected {
                operation: "create_token".to_string(),
                status: 400,
                message: format!("policy '{}' does not exist", policy),
            });
        }
        let token = generate_secret("s.");
        inner.tokens.insert(token.clone(), vec![policy.to_string()]);
        Ok(ScopedToken { token: SecretString::new(token), policy: policy.to_string() })
    }

    async fn write_secret(
        &self,
        session: &Session,
        mount: &str,
        path: &str,
        fields: &SecretFields,
    ) -> Result<()> {
        let mut inner = self.enter("write_secret")?;
        inner.require_root("write_secret", session)?;
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(Error::remote_write_failed("write_secret", "502: bad gateway"));
        }
        if !inner.mounts.contains(mount) {
            return Err(Error::Rejected {
                operation: "write_secret".to_string(),
                status: 404,
                message: format!("no handler for route '{}/data/{}'", mount, path),
            });
        }
        inner.secrets.insert((mount.to_string(), path.to_string()), fields.clone());
        Ok(())
    }

    async fn read_secret(
        &self,
        session: &Session,
        mount: &str,
        path: &str,
    ) -> Result<SecretFields> {
        let inner = self.enter("read_secret")?;
        inner.require_unsealed("read_secret")?;
        let policies = inner.policies_for("read_secret", session)?;
        let data_path = format!("{}/data/{}", mount, path);
        let allowed = policies.iter().any(|p| {
            p == ROOT_POLICY
                || inner
                    .policies
                    .get(p.as_str())
                    .is_some_and(|body| policy_allows(body, &data_path, "read"))
        });
        if !allowed {
            return Err(Error::PermissionDenied {
                operation: "read_secret".to_string(),
                message: "permission denied".to_string(),
            });
        }
        inner
            .secrets
            .get(&(mount.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| Error::SecretNotFound { path: format!("{}/{}", mount, path) })
    }

    async fn delete_secret(&self, session: &Session, mount: &str, path: &str) -> Result<()> {
        let mut inner = self.enter("delete_secret")?;
        inner.require_root("delete_secret", session)?;
        inner.secrets.remove(&(mount.to_string(), path.to_string()));
        Ok(())
    }
}
