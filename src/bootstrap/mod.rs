//! Bootstrap controller.
//!
//! Decides, from the store's reported status and the local persisted state,
//! whether to initialize the store or to re-configure an existing one, and
//! drives either path to `Ready`:
//!
//! ```text
//! Unknown ──status──▶ NotInitialized ──initialize, persist, unseal──┐
//!                     InitializedSealed ──unseal──┐                 │
//!                     InitializedUnsealed ◀───────┘◀────────────────┘
//!                        │ login(root), mount, policy/token, publish
//!                        ▼
//!                      Ready
//! ```
//!
//! The flow is strictly sequential. Initialization must never race with
//! itself: two concurrent initializers against one store would produce two
//! unseal keys. Running one controller per store is a precondition of the
//! caller; there is no distributed lock here.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn, Instrument};

use crate::config::BootstrapConfig;
use crate::errors::{Error, Phase, Result};
use crate::publisher::{CredentialPublisher, CredentialSource, PublishReport};
use crate::retry::{retry, RetryPolicy};
use crate::secrets::SecretString;
use crate::state::{write_atomic, LocalStateStore, PersistedState};
use crate::store::{read_only_policy, SecretStore, Session, StoreStatus};

/// Single key share, threshold of one.
pub const KEY_SHARES: u32 = 1;
pub const KEY_THRESHOLD: u32 = 1;

/// Store state as seen by one status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoreState {
    NotInitialized,
    InitializedSealed,
    InitializedUnsealed,
}

impl From<StoreStatus> for StoreState {
    fn from(status: StoreStatus) -> Self {
        match (status.initialized, status.sealed) {
            (false, _) => StoreState::NotInitialized,
            (true, true) => StoreState::InitializedSealed,
            (true, false) => StoreState::InitializedUnsealed,
        }
    }
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreState::NotInitialized => write!(f, "not_initialized"),
            StoreState::InitializedSealed => write!(f, "initialized_sealed"),
            StoreState::InitializedUnsealed => write!(f, "initialized_unsealed"),
        }
    }
}

/// Which branch of the state machine a run took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPath {
    /// First run: the store was initialized by this invocation
    Initialized,
    /// The store was already initialized; credentials were republished
    Reconfigured,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub path: BootstrapPath,
    /// State observed before any action was taken
    pub observed: StoreState,
    /// Whether this run unsealed the store
    pub unsealed: bool,
    /// Whether this run created a new scoped token
    pub app_token_provisioned: bool,
    pub publish: PublishReport,
    /// Scoped application token (redacted when serialized)
    pub app_token: SecretString,
}

/// Snapshot of store status and local state, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub store_address: String,
    pub status: StoreStatus,
    pub state: StoreState,
    pub state_path: String,
    pub local_state_present: bool,
    pub initialized_at: Option<DateTime<Utc>>,
    pub has_unseal_key: bool,
    pub has_root_token: bool,
    pub has_app_token: bool,
    /// Whether the store and the local state agree on initialization
    pub consistent: bool,
}

/// Settings the controller needs beyond the store and the state file.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub kv_mount: String,
    pub policy_name: String,
    pub policy_body: String,
    pub app_token_file: Option<std::path::PathBuf>,
    pub wait_retry: RetryPolicy,
    pub call_retry: RetryPolicy,
}

impl From<&BootstrapConfig> for ControllerSettings {
    fn from(config: &BootstrapConfig) -> Self {
        let kv_mount = config.kv_mount.trim_matches('/').to_string();
        Self {
            policy_body: read_only_policy(&kv_mount, &config.credential_prefix),
            kv_mount,
            policy_name: config.policy_name.clone(),
            app_token_file: config.app_token_file.clone(),
            wait_retry: config.wait_retry.clone(),
            call_retry: config.call_retry.clone(),
        }
    }
}

/// The bootstrap state machine.
pub struct BootstrapController {
    store: Arc<dyn SecretStore>,
    state: LocalStateStore,
    publisher: CredentialPublisher,
    settings: ControllerSettings,
}

impl fmt::Debug for BootstrapController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapController")
            .field("store", &self.store.address())
            .field("state", &self.state.path())
            .field("settings", &self.settings)
            .finish()
    }
}

impl BootstrapController {
    pub fn new(
        store: Arc<dyn SecretStore>,
        state: LocalStateStore,
        publisher: CredentialPublisher,
        settings: ControllerSettings,
    ) -> Self {
        Self { store, state, publisher, settings }
    }

    /// Build a controller from validated configuration.
    pub fn from_config(store: Arc<dyn SecretStore>, config: &BootstrapConfig) -> Self {
        let settings = ControllerSettings::from(config);
        let publisher = CredentialPublisher::new(config.registry(), config.call_retry.clone());
        Self::new(store, LocalStateStore::new(&config.state_dir), publisher, settings)
    }

    /// Run the state machine to `Ready` or to a fatal error.
    pub async fn run(&self, source: &CredentialSource) -> Result<BootstrapReport> {
        let span = crate::bootstrap_span!("bootstrap", store = %self.store.address());
        let result = self.run_inner(source).instrument(span).await;

        let outcome = match &result {
            Ok(report) if report.path == BootstrapPath::Initialized => "initialized",
            Ok(_) => "reconfigured",
            Err(_) => "failed",
        };
        metrics::counter!("vault_bootstrap_runs_total", "outcome" => outcome).increment(1);
        result
    }

    async fn run_inner(&self, source: &CredentialSource) -> Result<BootstrapReport> {
        let local = self.state.load().map_err(|e| e.in_phase(Phase::WaitForStore))?;
        let status = self.wait_for_store().await?;
        let observed = StoreState::from(status);

        info!(
            state = %observed,
            local_state_present = local.is_some(),
            state_path = %self.state.path().display(),
            "Observed secret store state"
        );

        match observed {
            StoreState::NotInitialized => {
                if let Some(existing) = local {
                    return Err(Error::already_initialized(format!(
                        "local state {} records an initialization at {}, but the store at {} \
                         reports uninitialized; refusing to initialize again",
                        self.state.path().display(),
                        existing.initialized_at.to_rfc3339(),
                        self.store.address()
                    ))
                    .in_phase(Phase::Initialize));
                }
                self.initialize_sequence(source, observed).await
            }
            StoreState::InitializedSealed => {
                let unseal_key =
                    local.as_ref().and_then(|s| s.unseal_key.clone()).ok_or_else(|| {
                        Error::LostUnsealKey { state_path: self.state.path().display().to_string() }
                            .in_phase(Phase::Unseal)
                    })?;
                self.unseal(&unseal_key).await?;
                self.reconfigure(local, source, observed, true).await
            }
            StoreState::InitializedUnsealed => self.reconfigure(local, source, observed, false).await,
        }
    }

    /// Poll the store until it answers a status query.
    async fn wait_for_store(&self) -> Result<StoreStatus> {
        let status = retry(&self.settings.wait_retry, "status", || self.store.status())
            .await
            .map_err(|e| e.in_phase(Phase::WaitForStore))?;
        Ok(status)
    }

    /// First-run path: initialize, persist, unseal, configure, publish.
    async fn initialize_sequence(
        &self,
        source: &CredentialSource,
        observed: StoreState,
    ) -> Result<BootstrapReport> {
        info!(key_shares = KEY_SHARES, key_threshold = KEY_THRESHOLD, "Initializing secret store");

        let init = retry(&self.settings.call_retry, "initialize", || {
            self.store.initialize(KEY_SHARES, KEY_THRESHOLD)
        })
        .await
        .map_err(|e| e.in_phase(Phase::Initialize))?;

        // Nothing else may happen before the key and root token are on disk.
        let state = PersistedState::initialized(init.unseal_key, init.root_token);
        self.state.save(&state).map_err(|e| e.in_phase(Phase::Initialize))?;

        let unseal_key = state.unseal_key.clone().ok_or_else(|| {
            Error::LostUnsealKey { state_path: self.state.path().display().to_string() }
                .in_phase(Phase::Unseal)
        })?;
        self.unseal(&unseal_key).await?;

        let mut report = self.reconfigure(Some(state), source, observed, true).await?;
        report.path = BootstrapPath::Initialized;
        Ok(report)
    }

    /// Submit the unseal key and confirm the store reports unsealed.
    async fn unseal(&self, key: &SecretString) -> Result<()> {
        let submitted = retry(&self.settings.call_retry, "unseal", || self.store.unseal(key))
            .await
            .map_err(|e| e.in_phase(Phase::Unseal))?;

        let status = retry(&self.settings.call_retry, "status", || self.store.status())
            .await
            .map_err(|e| e.in_phase(Phase::Unseal))?;
        if status.sealed {
            // Share progress comes from the unseal answer; status may not carry it.
            return Err(Error::UnsealIncomplete {
                progress: submitted.progress,
                threshold: submitted.threshold,
            }
            .in_phase(Phase::Unseal));
        }

        info!("Secret store unsealed");
        Ok(())
    }

    /// Re-configure path: login with the root token, make sure the mount,
    /// policy and scoped token exist, then publish.
    async fn reconfigure(
        &self,
        local: Option<PersistedState>,
        source: &CredentialSource,
        observed: StoreState,
        unsealed: bool,
    ) -> Result<BootstrapReport> {
        let lost_root = || {
            Error::LostRootToken { state_path: self.state.path().display().to_string() }
                .in_phase(Phase::Login)
        };
        let state = local.ok_or_else(lost_root)?;
        let root_token = state.root_token.clone().ok_or_else(lost_root)?;

        let session = retry(&self.settings.call_retry, "login", || self.store.login(&root_token))
            .await
            .map_err(|e| e.in_phase(Phase::Login))?;
        if !session.is_root() {
            return Err(Error::PermissionDenied {
                operation: "login".to_string(),
                message: format!(
                    "token persisted as root in {} carries policies {:?}, not root",
                    self.state.path().display(),
                    session.policies()
                ),
            }
            .in_phase(Phase::Login));
        }
        info!(policies = ?session.policies(), "Authenticated with root token");

        retry(&self.settings.call_retry, "enable_kv_mount", || {
            self.store.enable_kv_mount(&session, &self.settings.kv_mount)
        })
        .await
        .map_err(|e| e.in_phase(Phase::Configure))?;

        let (state, app_token_provisioned) = self.ensure_app_token(&session, state).await?;
        let app_token = state.app_token.clone().ok_or_else(|| {
            Error::config("scoped token missing after provisioning").in_phase(Phase::Configure)
        })?;

        if let Some(path) = &self.settings.app_token_file {
            write_atomic(path, app_token.expose_secret().as_bytes())
                .map_err(|e| e.in_phase(Phase::Configure))?;
            info!(path = %path.display(), "Exported scoped application token");
        }

        let publish = self.publisher.publish(self.store.as_ref(), &session, source).await?;

        info!(
            published = publish.published.len(),
            skipped = publish.skipped.len(),
            "Secret store ready"
        );

        Ok(BootstrapReport {
            path: BootstrapPath::Reconfigured,
            observed,
            unsealed,
            app_token_provisioned,
            publish,
            app_token,
        })
    }

    /// Make sure a working scoped token is persisted.
    ///
    /// A missing token (crash between the two persists of the first run) or
    /// one the store no longer accepts is replaced; a valid one is kept as is.
    async fn ensure_app_token(
        &self,
        session: &Session,
        state: PersistedState,
    ) -> Result<(PersistedState, bool)> {
        if let Some(token) = &state.app_token {
            match self.store.login(token).await {
                Ok(_) => return Ok((state, false)),
                Err(Error::PermissionDenied { .. }) => {
                    warn!("Persisted scoped token was rejected by the store; issuing a new one");
                }
                Err(e) if e.is_retryable() => {
                    // Can't tell; keep the existing token rather than replace a good one.
                    warn!(error = %e, "Could not verify scoped token; keeping it");
                    return Ok((state, false));
                }
                Err(e) => return Err(e.in_phase(Phase::Configure)),
            }
        }

        let policy_name = &self.settings.policy_name;
        retry(&self.settings.call_retry, "write_policy", || {
            self.store.write_policy(session, policy_name, &self.settings.policy_body)
        })
        .await
        .map_err(|e| e.in_phase(Phase::Configure))?;
        info!(policy = %policy_name, "Wrote application policy");

        let scoped = retry(&self.settings.call_retry, "create_token", || {
            self.store.create_token(session, policy_name)
        })
        .await
        .map_err(|e| e.in_phase(Phase::Configure))?;

        let state = state.with_app_token(scoped.token, scoped.policy);
        self.state.save(&state).map_err(|e| e.in_phase(Phase::Configure))?;
        info!(policy = %policy_name, "Created scoped application token");

        Ok((state, true))
    }

    /// Report store status and local state without changing either.
    pub async fn inspect(&self) -> Result<Inspection> {
        let local = self.state.load()?;
        let status = self.wait_for_store().await?;
        let state = StoreState::from(status);

        let consistent = match (&local, state) {
            (None, StoreState::NotInitialized) => true,
            (Some(_), StoreState::NotInitialized) | (None, _) => false,
            (Some(s), StoreState::InitializedSealed) => {
                s.unseal_key.is_some() && s.root_token.is_some()
            }
            (Some(s), StoreState::InitializedUnsealed) => s.root_token.is_some(),
        };

        Ok(Inspection {
            store_address: self.store.address().to_string(),
            status,
            state,
            state_path: self.state.path().display().to_string(),
            local_state_present: local.is_some(),
            initialized_at: local.as_ref().map(|s| s.initialized_at),
            has_unseal_key: local.as_ref().is_some_and(|s| s.unseal_key.is_some()),
            has_root_token: local.as_ref().is_some_and(|s| s.root_token.is_some()),
            has_app_token: local.as_ref().is_some_and(|s| s.app_token.is_some()),
            consistent,
        })
    }
}
