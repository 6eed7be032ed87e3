//! Credential publishing.
//!
//! Writes one [`CredentialRecord`](crate::store::SecretFields) per dependent
//! service into the secret store, under a stable path, from the values in a
//! [`CredentialSource`]. Every publish overwrites: no merge, no history.
//!
//! A service is either *critical* (the database: a missing required field
//! aborts the publish before anything is written) or *best effort* (the
//! broker: missing fields are logged and the record is written with what is
//! available). A best-effort record with nothing to write is deleted, so
//! consumers never read values from an earlier run.

pub mod source;

use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{Error, Phase, Result};
use crate::retry::{retry, RetryPolicy};
use crate::store::{SecretFields, SecretStore, Session};

pub use source::CredentialSource;

/// Default KV mount the records live under.
pub const DEFAULT_MOUNT: &str = "kv";

/// How a missing source value is treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldRule {
    /// Must be present; failing that the service is incomplete
    Required,
    /// Written when present, silently omitted otherwise
    Optional,
    /// Falls back to the given value
    Default(String),
}

/// One field of a credential record and where its value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialField {
    pub name: String,
    pub env_var: String,
    pub rule: FieldRule,
}

impl CredentialField {
    pub fn new(name: impl Into<String>, env_var: impl Into<String>, rule: FieldRule) -> Self {
        Self { name: name.into(), env_var: env_var.into(), rule }
    }
}

/// Credential contract of one dependent service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCredentials {
    /// Service name used in logs and diagnostics
    pub service: String,
    /// Path of the record below the KV mount
    pub path: String,
    /// Whether a missing required field is fatal
    pub critical: bool,
    pub fields: Vec<CredentialField>,
}

impl ServiceCredentials {
    /// Names of the fields a complete record must contain.
    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| !matches!(f.rule, FieldRule::Optional))
            .map(|f| f.name.as_str())
    }

    /// Assemble the record from `source`.
    ///
    /// Returns the fields that could be filled and the required fields that
    /// are missing. For critical services the first missing required field
    /// is an error.
    pub fn resolve(&self, source: &CredentialSource) -> Result<(SecretFields, Vec<String>)> {
        let mut fields = SecretFields::new();
        let mut missing = Vec::new();

        for field in &self.fields {
            match (source.get(&field.env_var), &field.rule) {
                (Some(value), _) => {
                    fields.insert(field.name.clone(), value.to_string());
                }
                (None, FieldRule::Default(default)) => {
                    fields.insert(field.name.clone(), default.clone());
                }
                (None, FieldRule::Optional) => {}
                (None, FieldRule::Required) if self.critical => {
                    return Err(Error::missing_field(&self.service, &field.name, &field.env_var));
                }
                (None, FieldRule::Required) => missing.push(field.name.clone()),
            }
        }

        Ok((fields, missing))
    }
}

/// The set of services whose credentials are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRegistry {
    pub mount: String,
    pub services: Vec<ServiceCredentials>,
}

impl Default for CredentialRegistry {
    fn default() -> Self {
        Self::with_mount(DEFAULT_MOUNT)
    }
}

impl CredentialRegistry {
    /// The database and broker records under `mount`.
    pub fn with_mount(mount: impl Into<String>) -> Self {
        Self { mount: mount.into(), services: vec![database_credentials(), broker_credentials()] }
    }

    /// Nest every record path below `prefix`.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            for service in &mut self.services {
                service.path = format!("{}/{}", prefix, service.path);
            }
        }
        self
    }

    pub fn service(&self, name: &str) -> Option<&ServiceCredentials> {
        self.services.iter().find(|s| s.service == name)
    }

    /// Services whose record a successful bootstrap guarantees.
    pub fn critical(&self) -> impl Iterator<Item = &ServiceCredentials> {
        self.services.iter().filter(|s| s.critical)
    }
}

/// PostgreSQL credentials at `database/credentials`.
pub fn database_credentials() -> ServiceCredentials {
    ServiceCredentials {
        service: "database".to_string(),
        path: "database/credentials".to_string(),
        critical: true,
        fields: vec![
            CredentialField::new("username", "DB_USER", FieldRule::Required),
            CredentialField::new("password", "DB_PASSWORD", FieldRule::Required),
            CredentialField::new("dbname", "DB_NAME", FieldRule::Required),
            CredentialField::new("host", "DB_HOST", FieldRule::Default("postgres".to_string())),
            CredentialField::new("port", "DB_PORT", FieldRule::Default("5432".to_string())),
        ],
    }
}

/// Kafka endpoint at `kafka/credentials`.
pub fn broker_credentials() -> ServiceCredentials {
    ServiceCredentials {
        service: "broker".to_string(),
        path: "kafka/credentials".to_string(),
        critical: false,
        fields: vec![CredentialField::new(
            "bootstrap_servers",
            "KAFKA_BOOTSTRAP_SERVERS",
            FieldRule::Required,
        )],
    }
}

/// A record that was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedRecord {
    pub service: String,
    pub path: String,
    /// Field names written (values are never reported)
    pub fields: Vec<String>,
    /// Required fields that were absent
    pub missing: Vec<String>,
}

/// Outcome of one publish pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub published: Vec<PublishedRecord>,
    /// Services with nothing to write
    pub skipped: Vec<String>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.published.iter().all(|r| r.missing.is_empty())
    }
}

/// Writes the registry's records through an authenticated session.
#[derive(Debug, Clone)]
pub struct CredentialPublisher {
    registry: CredentialRegistry,
    retry: RetryPolicy,
}

impl CredentialPublisher {
    pub fn new(registry: CredentialRegistry, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }

    pub fn registry(&self) -> &CredentialRegistry {
        &self.registry
    }

    /// Publish every registered record.
    ///
    /// All records are resolved before the first write, so a missing
    /// database field leaves the store untouched.
    pub async fn publish<S>(
        &self,
        store: &S,
        session: &Session,
        source: &CredentialSource,
    ) -> Result<PublishReport>
    where
        S: SecretStore + ?Sized,
    {
        let mut resolved = Vec::with_capacity(self.registry.services.len());
        for service in &self.registry.services {
            let (fields, missing) = service.resolve(source).map_err(|e| e.in_phase(Phase::Publish))?;
            resolved.push((service, fields, missing));
        }

        let mut report = PublishReport::default();
        for (service, fields, missing) in resolved {
            if !missing.is_empty() {
                warn!(
                    service = %service.service,
                    path = %service.path,
                    missing = ?missing,
                    "Credential source is missing fields; publishing the rest"
                );
            }

            if fields.is_empty() {
                warn!(service = %service.service, path = %service.path, "No credential fields available; record not written");
                retry(&self.retry, "delete_secret", || {
                    store.delete_secret(session, &self.registry.mount, &service.path)
                })
                .await
                .map_err(|e| e.in_phase(Phase::Publish))?;
                report.skipped.push(service.service.clone());
                continue;
            }

            retry(&self.retry, "write_secret", || {
                store.write_secret(session, &self.registry.mount, &service.path, &fields)
            })
            .await
            .map_err(|e| e.in_phase(Phase::Publish))?;

            metrics::counter!("vault_bootstrap_records_published_total", "service" => service.service.clone())
                .increment(1);
            info!(
                service = %service.service,
                mount = %self.registry.mount,
                path = %service.path,
                fields = ?fields.keys().collect::<Vec<_>>(),
                "Published credentials"
            );

            report.published.push(PublishedRecord {
                service: service.service.clone(),
                path: service.path.clone(),
                fields: fields.keys().cloned().collect(),
                missing,
            });
        }

        Ok(report)
    }
}
