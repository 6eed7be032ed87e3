//! Integration tests for the HTTP secret store client
//!
//! A wiremock server stands in for the store's `/v1` API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use vault_bootstrap::bootstrap::ControllerSettings;
use vault_bootstrap::store::{read_only_policy, HttpStoreConfig, SecretFields, Session};
use vault_bootstrap::{
    BootstrapController, BootstrapPath, CredentialPublisher, CredentialRegistry, Error,
    HttpSecretStore, LocalStateStore, SecretStore, SecretString,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> HttpSecretStore {
    HttpSecretStore::new(HttpStoreConfig {
        address: server.uri(),
        namespace: None,
        timeout: Duration::from_secs(5),
    })
    .unwrap()
}

fn root_session() -> Session {
    Session::new(SecretString::new("s.root"), vec!["root".to_string()])
}

fn errors(message: &str) -> serde_json::Value {
    json!({ "errors": [message] })
}

fn health(initialized: bool, sealed: bool) -> serde_json::Value {
    json!({
        "cluster_id": "c-1",
        "cluster_name": "vault-cluster",
        "initialized": initialized,
        "performance_standby": false,
        "sealed": sealed,
        "server_time_utc": 1_700_000_000u64,
        "standby": false,
        "version": "1.15.2"
    })
}

fn health_response(status: u16, initialized: bool, sealed: bool) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(health(initialized, sealed))
}

/// Response envelope used by authenticated endpoints.
fn envelope(data: serde_json::Value, auth: serde_json::Value) -> serde_json::Value {
    json!({
        "request_id": "r-1",
        "lease_id": "",
        "lease_duration": 0,
        "renewable": false,
        "data": data,
        "auth": auth,
        "warnings": null,
        "wrap_info": null
    })
}

fn lookup_self(policies: &[&str]) -> serde_json::Value {
    envelope(
        json!({
            "accessor": "acc",
            "creation_time": 1_700_000_000u64,
            "creation_ttl": 0,
            "display_name": "token",
            "entity_id": "",
            "expire_time": null,
            "explicit_max_ttl": 0,
            "id": "s.token",
            "issue_time": "2024-01-01T00:00:00Z",
            "meta": null,
            "num_uses": 0,
            "orphan": true,
            "path": "auth/token/create",
            "policies": policies,
            "renewable": false,
            "ttl": 0
        }),
        serde_json::Value::Null,
    )
}

fn token_created(token: &str, policy: &str) -> serde_json::Value {
    envelope(
        serde_json::Value::Null,
        json!({
            "client_token": token,
            "accessor": "acc",
            "policies": [policy],
            "token_policies": [policy],
            "metadata": null,
            "lease_duration": 0,
            "renewable": false,
            "entity_id": "",
            "token_type": "service",
            "orphan": true
        }),
    )
}

fn version_metadata(version: u64) -> serde_json::Value {
    json!({
        "created_time": "2024-01-01T00:00:00Z",
        "deletion_time": "",
        "custom_metadata": null,
        "destroyed": false,
        "version": version
    })
}

fn kv_written(version: u64) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_json(envelope(version_metadata(version), serde_json::Value::Null))
}

#[tokio::test]
async fn test_status_reports_seal_state() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/health"))
        .respond_with(health_response(503, true, true))
        .expect(1)
        .mount(&server)
        .await;

    let status = client(&server).status().await.unwrap();
    assert!(status.initialized);
    assert!(status.sealed);
}

#[tokio::test]
async fn test_status_uninitialized_and_ready() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/health"))
        .respond_with(health_response(501, false, true))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/health"))
        .respond_with(health_response(200, true, false))
        .with_priority(2)
        .mount(&server)
        .await;

    let store = client(&server);
    let first = store.status().await.unwrap();
    assert!(!first.initialized);

    let second = store.status().await.unwrap();
    assert!(second.ready());
}

#[tokio::test]
async fn test_initialize_single_share() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sys/init"))
        .and(body_partial_json(json!({ "secret_shares": 1, "secret_threshold": 1 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": ["abcd"], "keys_base64": ["q80="], "root_token": "s.root"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let init = client(&server).initialize(1, 1).await.unwrap();
    assert_eq!(init.unseal_key.expose_secret(), "abcd");
    assert_eq!(init.root_token.expose_secret(), "s.root");
}

#[tokio::test]
async fn test_initialize_twice_is_already_initialized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(400).set_body_json(errors("Vault is already initialized")))
        .mount(&server)
        .await;

    let err = client(&server).initialize(1, 1).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyInitialized { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_unseal_reports_progress() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .and(body_partial_json(json!({ "key": "unseal-key" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "type": "shamir", "initialized": true, "sealed": true,
            "t": 3, "n": 5, "progress": 1, "version": "1.15.2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let status = client(&server).unseal(&SecretString::new("unseal-key")).await.unwrap();
    assert!(status.sealed);
    assert_eq!(status.progress, 1);
    assert_eq!(status.threshold, 3);
}

#[tokio::test]
async fn test_login_reads_policies() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/auth/token/lookup-self"))
        .and(header("X-Vault-Token", "s.app"))
        .respond_with(ResponseTemplate::new(200).set_body_json(lookup_self(&["app-policy", "default"])))
        .mount(&server)
        .await;

    let session = client(&server).login(&SecretString::new("s.app")).await.unwrap();
    assert_eq!(session.policies(), ["app-policy".to_string(), "default".to_string()]);
    assert!(!session.is_root());
}

#[tokio::test]
async fn test_login_with_bad_token_is_permission_denied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/auth/token/lookup-self"))
        .respond_with(ResponseTemplate::new(403).set_body_json(errors("permission denied")))
        .mount(&server)
        .await;

    let err = client(&server).login(&SecretString::new("s.bad")).await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied { .. }));
}

#[tokio::test]
async fn test_mount_already_in_use_is_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/sys/mounts/kv"))
        .and(body_partial_json(json!({ "type": "kv", "options": { "version": "2" } })))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(errors("path is already in use at kv/")),
        )
        .expect(1)
        .mount(&server)
        .await;

    client(&server).enable_kv_mount(&root_session(), "kv").await.unwrap();
}

#[tokio::test]
async fn test_write_secret_sends_token_and_namespace() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/kv/data/database/credentials"))
        .and(header("X-Vault-Token", "s.root"))
        .and(header("X-Vault-Namespace", "review"))
        .and(body_partial_json(json!({ "data": { "username": "svc", "password": "p" } })))
        .respond_with(kv_written(1))
        .expect(1)
        .mount(&server)
        .await;

    let store = HttpSecretStore::new(HttpStoreConfig {
        address: server.uri(),
        namespace: Some("review".to_string()),
        timeout: Duration::from_secs(5),
    })
    .unwrap();
    let fields = SecretFields::from([
        ("username".to_string(), "svc".to_string()),
        ("password".to_string(), "p".to_string()),
    ]);
    store.write_secret(&root_session(), "kv", "database/credentials", &fields).await.unwrap();
}

#[tokio::test]
async fn test_server_errors_are_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/kv/data/kafka/credentials"))
        .respond_with(ResponseTemplate::new(503).set_body_json(errors("Vault is sealed")))
        .mount(&server)
        .await;

    let fields = SecretFields::from([("bootstrap_servers".to_string(), "kafka:9092".to_string())]);
    let err = client(&server)
        .write_secret(&root_session(), "kv", "kafka/credentials", &fields)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RemoteWriteFailed { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_read_secret_missing_and_present() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/data/kafka/credentials"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "errors": [] })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/kv/data/database/credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(
            json!({
                "data": { "username": "svc", "port": 5432 },
                "metadata": version_metadata(3)
            }),
            serde_json::Value::Null,
        )))
        .mount(&server)
        .await;

    let store = client(&server);
    let err = store.read_secret(&root_session(), "kv", "kafka/credentials").await.unwrap_err();
    assert!(matches!(err, Error::SecretNotFound { .. }));

    let fields = store.read_secret(&root_session(), "kv", "database/credentials").await.unwrap();
    assert_eq!(fields.get("username").map(String::as_str), Some("svc"));
    assert_eq!(fields.get("port").map(String::as_str), Some("5432"));
}

#[tokio::test]
async fn test_closed_port_is_unreachable() {
    let store = HttpSecretStore::new(HttpStoreConfig {
        address: "http://127.0.0.1:1".to_string(),
        namespace: None,
        timeout: Duration::from_secs(2),
    })
    .unwrap();

    let err = store.status().await.unwrap_err();
    assert!(matches!(err, Error::Unreachable { .. }), "unexpected error: {err:?}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_controller_first_run_over_http() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/sys/health"))
        .respond_with(health_response(501, false, true))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sys/health"))
        .respond_with(health_response(200, true, false))
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/sys/init"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": ["unseal-key"], "keys_base64": ["dW5zZWFs"], "root_token": "s.root"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/unseal"))
        .and(body_partial_json(json!({ "key": "unseal-key" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sealed": false, "t": 1, "n": 1, "progress": 0, "version": "1.15.2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/auth/token/lookup-self"))
        .and(header("X-Vault-Token", "s.root"))
        .respond_with(ResponseTemplate::new(200).set_body_json(lookup_self(&["root"])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/sys/mounts/kv"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/sys/policy/app-policy"))
        .and(body_partial_json(json!({ "policy": read_only_policy("kv", "") })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/auth/token/create-orphan"))
        .and(body_partial_json(json!({ "policies": ["app-policy"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_created("s.app", "app-policy")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/kv/data/database/credentials"))
        .and(body_partial_json(json!({ "data": { "username": "svc", "host": "postgres" } })))
        .respond_with(kv_written(1))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/kv/data/kafka/credentials"))
        .respond_with(kv_written(1))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let settings = ControllerSettings {
        kv_mount: "kv".to_string(),
        policy_name: "app-policy".to_string(),
        policy_body: read_only_policy("kv", ""),
        app_token_file: None,
        wait_retry: common::fast_retry(3),
        call_retry: common::fast_retry(3),
    };
    let publisher = CredentialPublisher::new(CredentialRegistry::default(), common::fast_retry(3));
    let controller = BootstrapController::new(
        Arc::new(client(&server)),
        LocalStateStore::new(dir.path()),
        publisher,
        settings,
    );

    let report = controller.run(&common::full_source()).await.unwrap();
    assert_eq!(report.path, BootstrapPath::Initialized);
    assert_eq!(report.app_token.expose_secret(), "s.app");

    let state = LocalStateStore::new(dir.path()).load().unwrap().unwrap();
    assert_eq!(state.unseal_key.unwrap().expose_secret(), "unseal-key");
    assert_eq!(state.root_token.unwrap().expose_secret(), "s.root");
    assert_eq!(state.app_token.unwrap().expose_secret(), "s.app");
}
