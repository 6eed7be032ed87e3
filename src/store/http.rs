//! HTTP client for the secret store API.
//!
//! Built on `vaultrs`. Each trait operation is one request; no call is
//! retried here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rustify::errors::ClientError as RestClientError;
use serde_json::{Map, Value};
use tracing::{debug, info, Instrument};
use vaultrs::api::token::requests::CreateOrphanTokenRequest;
use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};
use vaultrs::error::ClientError;
use vaultrs::sys::ServerStatus;
use vaultrs::{kv2, sys, token};

use super::{InitializationResult, ScopedToken, SecretFields, SecretStore, Session, StoreStatus};
use crate::errors::{Error, Result};
use crate::secrets::SecretString;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Store address (e.g., "http://vault:8200")
    pub address: String,

    /// Namespace header value, if the store is namespaced
    pub namespace: Option<String>,

    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8200".to_string(),
            namespace: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Secret store client over HTTP.
///
/// Holds one unauthenticated [`VaultClient`]; calls made with a session
/// borrow its connection pool under the session token.
pub struct HttpSecretStore {
    client: VaultClient,
    address: String,
}

impl std::fmt::Debug for HttpSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSecretStore")
            .field("address", &self.address)
            .field("client", &"[VaultClient]")
            .finish()
    }
}

impl HttpSecretStore {
    /// Create a new client with the given configuration
    pub fn new(config: HttpStoreConfig) -> Result<Self> {
        // The settings builder panics on an unparsable address, so check first.
        let parsed = url::Url::parse(&config.address).map_err(|e| {
            Error::config(format!("Invalid store address '{}': {}", config.address, e))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "Store address must use http or https, got '{}'",
                parsed.scheme()
            )));
        }

        let address = config.address.trim_end_matches('/').to_string();

        let mut settings_builder = VaultClientSettingsBuilder::default();
        settings_builder.address(&address).token("").timeout(Some(config.timeout));
        if let Some(namespace) = config.namespace {
            settings_builder.namespace(Some(namespace));
        }

        let settings = settings_builder
            .build()
            .map_err(|e| Error::config(format!("Invalid store client configuration: {}", e)))?;

        let client = VaultClient::new(settings)
            .map_err(|e| Error::config(format!("Failed to create store client: {}", e)))?;

        Ok(Self { client, address })
    }

    /// A client carrying `token`, sharing the underlying connection pool.
    fn client_for(&self, token: &SecretString) -> VaultClient {
        let mut settings = self.client.settings.clone();
        settings.token = token.expose_secret().to_string();

        let mut middle = self.client.middle.clone();
        middle.token = token.expose_secret().to_string();

        VaultClient {
            http: rustify::clients::reqwest::Client {
                http: self.client.http.http.clone(),
                base: self.client.http.base.clone(),
            },
            middle,
            settings,
        }
    }

    /// Map a `vaultrs` failure onto the error taxonomy.
    fn map_error(&self, operation: &str, e: ClientError) -> Error {
        match e {
            ClientError::APIError { code, errors } => classify(operation, code, errors.join("; ")),
            ClientError::RestClientError { source } => match source {
                RestClientError::RequestError { source, .. } => {
                    let connect = source
                        .downcast_ref::<reqwest::Error>()
                        .is_some_and(|e| e.is_connect());
                    if connect {
                        Error::unreachable(&self.address, format!("{:#}", source))
                    } else {
                        Error::remote_write_failed(operation, format!("{:#}", source))
                    }
                }
                RestClientError::ServerResponseError { code, content } => {
                    classify(operation, code, content.unwrap_or_default().trim().to_string())
                }
                RestClientError::ResponseError { source } => {
                    Error::remote_write_failed(operation, format!("{:#}", source))
                }
                other => Error::Rejected {
                    operation: operation.to_string(),
                    status: 0,
                    message: other.to_string(),
                },
            },
            other => Error::Rejected {
                operation: operation.to_string(),
                status: 0,
                message: other.to_string(),
            },
        }
    }
}

fn classify(operation: &str, code: u16, message: String) -> Error {
    let lower = message.to_ascii_lowercase();
    match code {
        400 if lower.contains("already initialized") => Error::already_initialized(message),
        401 | 403 => Error::PermissionDenied { operation: operation.to_string(), message },
        408 | 429 | 500..=599 => {
            Error::remote_write_failed(operation, format!("status {}: {}", code, message))
        }
        status => Error::Rejected { operation: operation.to_string(), status, message },
    }
}

fn string_fields(data: Map<String, Value>) -> SecretFields {
    data.into_iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, value)
        })
        .collect()
}

#[async_trait]
impl SecretStore for HttpSecretStore {
    fn address(&self) -> &str {
        &self.address
    }

    async fn status(&self) -> Result<StoreStatus> {
        let status = sys::status(&self.client)
            .instrument(crate::store_span!("status"))
            .await
            .map_err(|e| self.map_error("status", e))?;
        debug!(?status, "Store health");

        // Unseal progress is only reported by the unseal endpoint.
        let (initialized, sealed) = match status {
            ServerStatus::UNINITIALIZED => (false, true),
            ServerStatus::SEALED => (true, true),
            ServerStatus::OK | ServerStatus::STANDBY | ServerStatus::PERFSTANDBY => (true, false),
            other => {
                return Err(Error::Rejected {
                    operation: "status".to_string(),
                    status: 0,
                    message: format!("unsupported server status {:?}", other),
                })
            }
        };
        Ok(StoreStatus { initialized, sealed, progress: 0, threshold: 0 })
    }

    async fn initialize(
        &self,
        key_shares: u32,
        key_threshold: u32,
    ) -> Result<InitializationResult> {
        let response =
            sys::start_initialization(&self.client, key_shares.into(), key_threshold.into(), None)
                .instrument(crate::store_span!("initialize"))
                .await
                .map_err(|e| self.map_error("initialize", e))?;

        let unseal_key = response.keys.into_iter().next().ok_or_else(|| Error::Rejected {
            operation: "initialize".to_string(),
            status: 200,
            message: "response contained no unseal keys".to_string(),
        })?;

        info!(address = %self.address, key_shares, key_threshold, "Secret store initialized");
        Ok(InitializationResult {
            unseal_key: SecretString::new(unseal_key),
            root_token: SecretString::new(response.root_token),
        })
    }

    async fn unseal(&self, key: &SecretString) -> Result<StoreStatus> {
        let response =
            sys::unseal(&self.client, Some(key.expose_secret().to_string()), None, None)
                .instrument(crate::store_span!("unseal"))
                .await
                .map_err(|e| self.map_error("unseal", e))?;

        Ok(StoreStatus {
            initialized: true,
            sealed: response.sealed,
            progress: u32::try_from(response.progress).unwrap_or(u32::MAX),
            threshold: u32::try_from(response.threshold).unwrap_or(u32::MAX),
        })
    }

    async fn login(&self, token: &SecretString) -> Result<Session> {
        let client = self.client_for(token);
        let lookup = token::lookup_self(&client)
            .instrument(crate::store_span!("login"))
            .await
            .map_err(|e| self.map_error("login", e))?;
        Ok(Session::new(token.clone(), lookup.policies))
    }

    async fn enable_kv_mount(&self, session: &Session, mount: &str) -> Result<()> {
        let mount = mount.trim_matches('/');
        let client = self.client_for(session.token());
        let mut opts = vaultrs::api::sys::requests::EnableEngineRequest::builder();
        opts.options(HashMap::from([("version".to_string(), "2".to_string())]));

        let result = sys::mount::enable(&client, mount, "kv", Some(&mut opts))
            .instrument(crate::store_span!("enable_kv_mount"))
            .await
            .map_err(|e| self.map_error("enable_kv_mount", e));

        match result {
            Ok(()) => {
                info!(mount, "Enabled KV v2 secrets engine");
                Ok(())
            }
            Err(Error::Rejected { status: 400, message, .. })
                if message.to_ascii_lowercase().contains("already in use") =>
            {
                debug!(mount, "KV secrets engine already mounted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn write_policy(&self, session: &Session, name: &str, body: &str) -> Result<()> {
        let client = self.client_for(session.token());
        sys::policy::set(&client, name, body)
            .instrument(crate::store_span!("write_policy"))
            .await
            .map_err(|e| self.map_error("write_policy", e))
    }

    async fn create_token(&self, session: &Session, policy: &str) -> Result<ScopedToken> {
        let client = self.client_for(session.token());
        let mut opts = CreateOrphanTokenRequest::builder();
        opts.policies(vec![policy.to_string()]).display_name(policy);

        let auth = token::new_orphan(&client, Some(&mut opts))
            .instrument(crate::store_span!("create_token"))
            .await
            .map_err(|e| self.map_error("create_token", e))?;

        Ok(ScopedToken { token: SecretString::new(auth.client_token), policy: policy.to_string() })
    }

    async fn write_secret(
        &self,
        session: &Session,
        mount: &str,
        path: &str,
        fields: &SecretFields,
    ) -> Result<()> {
        let client = self.client_for(session.token());
        let metadata = kv2::set(&client, mount.trim_matches('/'), path.trim_matches('/'), fields)
            .instrument(crate::store_span!("write_secret"))
            .await
            .map_err(|e| self.map_error("write_secret", e))?;
        debug!(mount, path, version = metadata.version, "Wrote secret");
        Ok(())
    }

    async fn read_secret(
        &self,
        session: &Session,
        mount: &str,
        path: &str,
    ) -> Result<SecretFields> {
        let client = self.client_for(session.token());
        let not_found = || Error::SecretNotFound { path: format!("{}/{}", mount, path) };

        let data: Option<Map<String, Value>> =
            match kv2::read(&client, mount.trim_matches('/'), path.trim_matches('/'))
                .instrument(crate::store_span!("read_secret"))
                .await
            {
                Ok(data) => data,
                Err(ClientError::APIError { code: 404, .. })
                | Err(ClientError::RestClientError {
                    source: RestClientError::ServerResponseError { code: 404, .. },
                }) => return Err(not_found()),
                Err(e) => return Err(self.map_error("read_secret", e)),
            };

        // Soft-deleted versions come back with `data: null`.
        data.map(string_fields).ok_or_else(not_found)
    }

    async fn delete_secret(&self, session: &Session, mount: &str, path: &str) -> Result<()> {
        let client = self.client_for(session.token());
        match kv2::delete_latest(&client, mount.trim_matches('/'), path.trim_matches('/'))
            .instrument(crate::store_span!("delete_secret"))
            .await
        {
            Ok(())
            | Err(ClientError::APIError { code: 404, .. })
            | Err(ClientError::RestClientError {
                source: RestClientError::ServerResponseError { code: 404, .. },
            }) => Ok(()),
            Err(e) => Err(self.map_error("delete_secret", e)),
        }
    }
}
