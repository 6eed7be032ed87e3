//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use vault_bootstrap::bootstrap::ControllerSettings;
use vault_bootstrap::store::read_only_policy;
use vault_bootstrap::{
    BootstrapController, CredentialPublisher, CredentialRegistry, CredentialSource,
    InMemorySecretStore, LocalStateStore, RetryPolicy,
};

/// Millisecond retries so failure budgets are spent quickly.
pub fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(attempts, Duration::from_millis(1))
}

pub fn settings(wait_attempts: u32) -> ControllerSettings {
    ControllerSettings {
        kv_mount: "kv".to_string(),
        policy_name: "app-policy".to_string(),
        policy_body: read_only_policy("kv", ""),
        app_token_file: None,
        wait_retry: fast_retry(wait_attempts),
        call_retry: fast_retry(3),
    }
}

pub fn controller_with(
    store: Arc<InMemorySecretStore>,
    state_dir: &Path,
    settings: ControllerSettings,
) -> BootstrapController {
    let publisher = CredentialPublisher::new(CredentialRegistry::default(), fast_retry(3));
    BootstrapController::new(store, LocalStateStore::new(state_dir), publisher, settings)
}

pub fn controller(store: Arc<InMemorySecretStore>, state_dir: &Path) -> BootstrapController {
    controller_with(store, state_dir, settings(5))
}

/// The credential source of the reference deployment.
pub fn full_source() -> CredentialSource {
    CredentialSource::from_pairs([
        ("DB_USER", "svc"),
        ("DB_PASSWORD", "p"),
        ("DB_NAME", "d"),
        ("DB_HOST", "postgres"),
        ("DB_PORT", "5432"),
        ("KAFKA_BOOTSTRAP_SERVERS", "kafka:9092"),
    ])
}
