//! Readiness gate for dependent services.
//!
//! Secret store startup and bootstrap run asynchronously to the services
//! that consume credentials, so a consumer must not assume its record is
//! there on first read. [`wait_for_credentials`] logs in with the scoped
//! token and polls each requested record, with bounded retry and backoff,
//! until it exists and carries every required field.
//!
//! Without an explicit service list the gate covers the critical records,
//! the ones a successful bootstrap guarantees. Best-effort records (the
//! broker) are only awaited when named.

use std::collections::BTreeMap;

use tracing::{debug, info, Instrument};

use crate::errors::{Error, Phase, Result};
use crate::publisher::{CredentialRegistry, ServiceCredentials};
use crate::retry::{retry, RetryPolicy};
use crate::secrets::SecretString;
use crate::store::{SecretFields, SecretStore, Session};

/// Credential records that passed the gate, keyed by service name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadyCredentials {
    pub records: BTreeMap<String, SecretFields>,
}

impl ReadyCredentials {
    pub fn record(&self, service: &str) -> Option<&SecretFields> {
        self.records.get(service)
    }

    /// Typed view of the database record.
    pub fn database(&self) -> Result<DatabaseCredentials> {
        let fields = self
            .record("database")
            .ok_or_else(|| Error::config("database credentials were not requested"))?;
        DatabaseCredentials::from_fields(fields)
    }

    /// Typed view of the broker record.
    pub fn broker(&self) -> Result<BrokerCredentials> {
        let fields = self
            .record("broker")
            .ok_or_else(|| Error::config("broker credentials were not requested"))?;
        BrokerCredentials::from_fields(fields)
    }
}

/// Block until the records of `services` (the critical services when
/// empty) are readable and complete.
pub async fn wait_for_credentials<S>(
    store: &S,
    token: &SecretString,
    registry: &CredentialRegistry,
    services: &[String],
    policy: &RetryPolicy,
) -> Result<ReadyCredentials>
where
    S: SecretStore + ?Sized,
{
    let span = crate::bootstrap_span!("wait_ready", services = ?services);
    wait_inner(store, token, registry, services, policy).instrument(span).await
}

async fn wait_inner<S>(
    store: &S,
    token: &SecretString,
    registry: &CredentialRegistry,
    services: &[String],
    policy: &RetryPolicy,
) -> Result<ReadyCredentials>
where
    S: SecretStore + ?Sized,
{
    let selected = select_services(registry, services)?;

    let session = retry(policy, "login", || store.login(token))
        .await
        .map_err(|e| e.in_phase(Phase::Readiness))?;

    let mut ready = ReadyCredentials::default();
    for service in selected {
        let fields = retry(policy, "read_secret", || {
            read_complete(store, &session, &registry.mount, service)
        })
        .await
        .map_err(|e| e.in_phase(Phase::Readiness))?;

        info!(service = %service.service, path = %service.path, "Credentials ready");
        ready.records.insert(service.service.clone(), fields);
    }

    Ok(ready)
}

fn select_services<'a>(
    registry: &'a CredentialRegistry,
    services: &[String],
) -> Result<Vec<&'a ServiceCredentials>> {
    if services.is_empty() {
        return Ok(registry.critical().collect());
    }
    services
        .iter()
        .map(|name| {
            registry
                .service(name)
                .ok_or_else(|| Error::config(format!("Unknown service '{}'", name)))
        })
        .collect()
}

/// Read one record, reporting absent or partial records as [`Error::NotReady`].
async fn read_complete<S>(
    store: &S,
    session: &Session,
    mount: &str,
    service: &ServiceCredentials,
) -> Result<SecretFields>
where
    S: SecretStore + ?Sized,
{
    let fields = match store.read_secret(session, mount, &service.path).await {
        Ok(fields) => fields,
        Err(Error::SecretNotFound { path }) => {
            return Err(Error::NotReady { path, reason: "record not published yet".to_string() })
        }
        Err(e) => return Err(e),
    };

    let missing: Vec<&str> =
        service.required_fields().filter(|name| !fields.contains_key(*name)).collect();
    if !missing.is_empty() {
        debug!(service = %service.service, missing = ?missing, "Credential record incomplete");
        return Err(Error::NotReady {
            path: format!("{}/{}", mount, service.path),
            reason: format!("missing fields: {}", missing.join(", ")),
        });
    }

    Ok(fields)
}

/// Database connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub username: String,
    pub password: SecretString,
}

impl DatabaseCredentials {
    pub fn from_fields(fields: &SecretFields) -> Result<Self> {
        let get = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| Error::config(format!("database record has no '{}' field", name)))
        };

        let port = get("port")?;
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::config(format!("Invalid database port '{}': {}", port, e)))?;

        Ok(Self {
            host: get("host")?,
            port,
            dbname: get("dbname")?,
            username: get("username")?,
            password: SecretString::new(get("password")?),
        })
    }

    /// `postgres://` URL with user and password percent-encoded.
    pub fn connection_url(&self) -> Result<SecretString> {
        let mut url = url::Url::parse(&format!("postgres://{}:{}/", self.host, self.port))
            .map_err(|e| Error::config(format!("Invalid database host '{}': {}", self.host, e)))?;
        url.set_path(&self.dbname);
        url.set_username(&self.username)
            .and_then(|_| url.set_password(Some(self.password.expose_secret())))
            .map_err(|_| Error::config("database URL cannot carry credentials"))?;
        Ok(SecretString::new(url.to_string()))
    }
}

/// Message broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCredentials {
    pub bootstrap_servers: Vec<String>,
}

impl BrokerCredentials {
    pub fn from_fields(fields: &SecretFields) -> Result<Self> {
        let raw = fields
            .get("bootstrap_servers")
            .ok_or_else(|| Error::config("broker record has no 'bootstrap_servers' field"))?;
        let bootstrap_servers: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if bootstrap_servers.is_empty() {
            return Err(Error::config("broker record has an empty 'bootstrap_servers' field"));
        }
        Ok(Self { bootstrap_servers })
    }
}
