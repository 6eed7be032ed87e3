//! # Vault Bootstrap
//!
//! Brings a Vault-compatible secret store from a freshly started, possibly
//! uninitialized instance to a state where the application services of the
//! review stack can fetch their database and message broker credentials
//! from it.
//!
//! ## Architecture
//!
//! ```text
//! Credential Source ─┐
//!                    ▼
//! BootstrapController ──SecretStore──▶ secret store (HTTP /v1)
//!        │                                   ▲
//!        ▼                                   │ scoped token
//!  LocalStateStore                     Readiness Gate ◀── dependent services
//! ```
//!
//! ## Core Components
//!
//! - **Store client** ([`store`]): typed operations over the store's HTTP API
//! - **Bootstrap controller** ([`bootstrap`]): the initialize/unseal/configure
//!   state machine, re-entrant across container restarts
//! - **Local state** ([`state`]): atomically persisted unseal key and tokens
//! - **Publisher** ([`publisher`]): writes one credential record per service
//! - **Readiness gate** ([`readiness`]): consumer-side wait for records
//! - **Launcher** ([`launcher`]): bootstrap-then-exec process supervision
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vault_bootstrap::{
//!     BootstrapConfig, BootstrapController, CredentialSource, HttpSecretStore, Result,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = BootstrapConfig::from_env()?;
//!     config.validate()?;
//!     let store = Arc::new(HttpSecretStore::new(config.http_store_config())?);
//!     let controller = BootstrapController::from_config(store, &config);
//!     controller.run(&CredentialSource::from_env()).await?;
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod errors;
pub mod launcher;
pub mod observability;
pub mod publisher;
pub mod readiness;
pub mod retry;
pub mod secrets;
pub mod state;
pub mod store;

// Re-export commonly used types and traits
pub use bootstrap::{BootstrapController, BootstrapPath, BootstrapReport, StoreState};
pub use config::BootstrapConfig;
pub use errors::{Error, Phase, Result};
pub use publisher::{CredentialPublisher, CredentialRegistry, CredentialSource};
pub use readiness::{wait_for_credentials, BrokerCredentials, DatabaseCredentials};
pub use retry::RetryPolicy;
pub use secrets::SecretString;
pub use state::{LocalStateStore, PersistedState};
pub use store::{HttpSecretStore, InMemorySecretStore, SecretStore};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
