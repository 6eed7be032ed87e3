//! Integration tests for the bootstrap state machine
//!
//! Drive the controller against the in-memory store and a temporary state
//! directory through first runs, restarts, crashes and operator mistakes.

mod common;

use std::sync::Arc;

use common::{controller, controller_with, full_source, settings};
use vault_bootstrap::store::SecretFields;
use vault_bootstrap::{
    BootstrapPath, CredentialSource, Error, InMemorySecretStore, LocalStateStore, Phase,
    PersistedState, SecretStore, StoreState,
};

fn expected_database_record() -> SecretFields {
    SecretFields::from([
        ("username".to_string(), "svc".to_string()),
        ("password".to_string(), "p".to_string()),
        ("dbname".to_string(), "d".to_string()),
        ("port".to_string(), "5432".to_string()),
        ("host".to_string(), "postgres".to_string()),
    ])
}

#[tokio::test]
async fn test_first_run_reaches_ready() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());

    let report = controller(store.clone(), dir.path()).run(&full_source()).await.unwrap();

    assert_eq!(report.path, BootstrapPath::Initialized);
    assert!(report.publish.is_complete());
    let calls = store.calls();
    let position = |op: &str| calls.iter().position(|c| *c == op).unwrap();
    assert_eq!(calls[0], "status");
    assert!(position("initialize") < position("unseal"));
    assert!(position("unseal") < position("write_secret"));
    let status = store.status().await.unwrap();
    assert!(status.initialized && !status.sealed);
    assert!(store.has_mount("kv"));
    assert!(store.policy("app-policy").unwrap().contains("kv/data/*"));

    let state = LocalStateStore::new(dir.path()).load().unwrap().unwrap();
    assert!(state.unseal_key.is_some());
    assert!(state.root_token.is_some());
    assert_eq!(state.app_policy.as_deref(), Some("app-policy"));
    let app_token = state.app_token.unwrap();
    assert_eq!(
        store.token_policies(app_token.expose_secret()),
        Some(vec!["app-policy".to_string()])
    );
}

#[tokio::test]
async fn test_repeated_runs_keep_persisted_values() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());
    let ctl = controller(store.clone(), dir.path());
    let state_store = LocalStateStore::new(dir.path());

    ctl.run(&full_source()).await.unwrap();
    let first = state_store.load().unwrap().unwrap();

    for _ in 0..3 {
        let report = ctl.run(&full_source()).await.unwrap();
        assert_eq!(report.path, BootstrapPath::Reconfigured);
        assert!(!report.app_token_provisioned);
    }

    let last = state_store.load().unwrap().unwrap();
    assert_eq!(first.unseal_key, last.unseal_key);
    assert_eq!(first.root_token, last.root_token);
    assert_eq!(first.app_token, last.app_token);
    assert_eq!(first.initialized_at, last.initialized_at);
    assert_eq!(store.call_count("initialize"), 1);
    assert_eq!(store.call_count("create_token"), 1);
    assert_eq!(store.policy_count(), 1);
}

#[tokio::test]
async fn test_restarted_store_is_unsealed_with_persisted_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());
    let ctl = controller(store.clone(), dir.path());

    ctl.run(&full_source()).await.unwrap();
    store.seal();

    let report = ctl.run(&full_source()).await.unwrap();
    assert_eq!(report.observed, StoreState::InitializedSealed);
    assert_eq!(report.path, BootstrapPath::Reconfigured);
    assert!(report.unsealed);
    assert!(!store.status().await.unwrap().sealed);
}

#[tokio::test]
async fn test_fresh_store_with_stale_state_refuses_to_initialize() {
    let dir = tempfile::tempdir().unwrap();

    // A previous store instance was bootstrapped with this state directory.
    let old_store = Arc::new(InMemorySecretStore::new());
    controller(old_store, dir.path()).run(&full_source()).await.unwrap();

    let fresh_store = Arc::new(InMemorySecretStore::new());
    let err = controller(fresh_store.clone(), dir.path()).run(&full_source()).await.unwrap_err();

    assert!(matches!(err, Error::Phase { phase: Phase::Initialize, .. }));
    assert!(matches!(err.root(), Error::AlreadyInitialized { .. }));
    assert_eq!(fresh_store.call_count("initialize"), 0);
}

#[tokio::test]
async fn test_sealed_store_without_key_is_lost_unseal_key() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());
    store.initialize(1, 1).await.unwrap();

    let err = controller(store.clone(), dir.path()).run(&full_source()).await.unwrap_err();

    assert!(matches!(err, Error::Phase { phase: Phase::Unseal, .. }));
    match err.root() {
        Error::LostUnsealKey { state_path } => assert!(state_path.ends_with("bootstrap-state.json")),
        other => panic!("expected LostUnsealKey, got {other:?}"),
    }
    assert_eq!(store.call_count("unseal"), 0);
}

#[tokio::test]
async fn test_unsealed_store_without_root_token_is_lost_root_token() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());
    let init = store.initialize(1, 1).await.unwrap();
    store.unseal(&init.unseal_key).await.unwrap();

    let err = controller(store, dir.path()).run(&full_source()).await.unwrap_err();
    assert!(matches!(err, Error::Phase { phase: Phase::Login, .. }));
    assert!(matches!(err.root(), Error::LostRootToken { .. }));
}

#[tokio::test]
async fn test_partial_state_with_only_key_and_root_token() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());
    let init = store.initialize(1, 1).await.unwrap();
    LocalStateStore::new(dir.path())
        .save(&PersistedState::initialized(init.unseal_key, init.root_token))
        .unwrap();

    let report = controller(store.clone(), dir.path()).run(&full_source()).await.unwrap();
    assert_eq!(report.path, BootstrapPath::Reconfigured);
    assert!(report.unsealed);
    assert!(report.app_token_provisioned);
    assert_eq!(store.call_count("initialize"), 1);
}

#[tokio::test]
async fn test_credential_round_trip_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());
    let source = CredentialSource::from_pairs([
        ("DB_USER", "svc"),
        ("DB_PASSWORD", "p"),
        ("DB_NAME", "d"),
        ("KAFKA_BOOTSTRAP_SERVERS", "kafka:9092"),
    ]);

    let report = controller(store.clone(), dir.path()).run(&source).await.unwrap();

    let session = store.login(&report.app_token).await.unwrap();
    let record = store.read_secret(&session, "kv", "database/credentials").await.unwrap();
    assert_eq!(record, expected_database_record());
}

#[tokio::test]
async fn test_missing_database_password_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());
    let source = CredentialSource::from_pairs([("DB_USER", "svc"), ("DB_NAME", "d")]);

    let err = controller(store.clone(), dir.path()).run(&source).await.unwrap_err();
    assert!(matches!(err, Error::Phase { phase: Phase::Publish, .. }));
    match err.root() {
        Error::MissingRequiredCredentialField { field, env_var, .. } => {
            assert_eq!(field, "password");
            assert_eq!(env_var, "DB_PASSWORD");
        }
        other => panic!("expected missing field, got {other:?}"),
    }
    assert!(store.secret("kv", "database/credentials").is_none());
}

#[tokio::test]
async fn test_missing_broker_endpoint_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());
    let source =
        CredentialSource::from_pairs([("DB_USER", "svc"), ("DB_PASSWORD", "p"), ("DB_NAME", "d")]);

    let report = controller(store.clone(), dir.path()).run(&source).await.unwrap();
    assert_eq!(report.publish.skipped, vec!["broker".to_string()]);
    assert!(store.secret("kv", "database/credentials").is_some());
    assert!(store.secret("kv", "kafka/credentials").is_none());
}

#[tokio::test]
async fn test_unreachable_store_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());
    store.fail_unreachable(4);

    let report = controller_with(store.clone(), dir.path(), settings(5))
        .run(&full_source())
        .await
        .unwrap();
    assert_eq!(report.path, BootstrapPath::Initialized);
    assert_eq!(store.call_count("initialize"), 1);
}

#[tokio::test]
async fn test_unreachable_store_beyond_budget() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());
    store.fail_unreachable(5);

    let err = controller_with(store.clone(), dir.path(), settings(5))
        .run(&full_source())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Phase { phase: Phase::WaitForStore, .. }));
    assert!(matches!(err.root(), Error::Unreachable { .. }));
    assert_eq!(store.call_count("status"), 5);
    assert_eq!(store.call_count("initialize"), 0);
    assert!(LocalStateStore::new(dir.path()).load().unwrap().is_none());
}

#[tokio::test]
async fn test_app_token_exported_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let token_file = dir.path().join("secrets").join("app-token");
    let store = Arc::new(InMemorySecretStore::new());
    let mut settings = settings(5);
    settings.app_token_file = Some(token_file.clone());

    let report = controller_with(store, dir.path(), settings).run(&full_source()).await.unwrap();
    let exported = std::fs::read_to_string(&token_file).unwrap();
    assert_eq!(exported, report.app_token.expose_secret());
}

#[tokio::test]
async fn test_report_never_serializes_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(InMemorySecretStore::new());

    let report = controller(store, dir.path()).run(&full_source()).await.unwrap();
    let json = serde_json::to_string(&report).unwrap();
    assert!(!json.contains(report.app_token.expose_secret()));
    assert!(json.contains("[REDACTED]"));
}
