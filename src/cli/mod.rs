//! # Command Line Interface
//!
//! Subcommands for the bootstrap container (`bootstrap`, `run`), for
//! operators (`status`) and for dependent services waiting on their
//! credentials (`wait-ready`, `fetch`).

pub mod config;
pub mod output;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::bootstrap::BootstrapController;
use crate::config::BootstrapConfig;
use crate::launcher::{Launcher, ProcessSpec};
use crate::observability::{init_logging, log_config_info, LogFormat};
use crate::publisher::CredentialSource;
use crate::readiness::wait_for_credentials;
use crate::store::{HttpSecretStore, SecretStore};

use self::config::{load_config, resolve_token, ConfigOverrides};
use self::output::{print_json, print_record, RecordFormat};

#[derive(Parser)]
#[command(name = "vault-bootstrap")]
#[command(about = "Secret store bootstrap and credential distribution")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Secret store address override
    #[arg(long, global = true)]
    pub store_address: Option<String>,

    /// Directory holding the persisted bootstrap state
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// KV mount holding the credential records
    #[arg(long, global = true)]
    pub kv_mount: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t, env = "VAULT_BOOTSTRAP_LOG_FORMAT")]
    pub log_format: LogFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize or re-configure the secret store and publish credentials
    Bootstrap {
        /// Also write the scoped application token to this file
        #[arg(long)]
        app_token_file: Option<PathBuf>,
    },

    /// Show the store status and the local bootstrap state
    Status,

    /// Block until credential records are published
    WaitReady {
        /// Services to wait for (the critical services if omitted)
        #[arg(long = "service")]
        services: Vec<String>,

        #[command(flatten)]
        token: TokenArgs,

        /// Number of polling attempts
        #[arg(long)]
        attempts: Option<u32>,
    },

    /// Print one credential record once it is published
    Fetch {
        /// Service whose record to print (database, broker)
        service: String,

        /// Output format
        #[arg(long, value_enum, default_value_t)]
        format: RecordFormat,

        #[command(flatten)]
        token: TokenArgs,
    },

    /// Bootstrap, then run an application with the scoped token
    Run {
        /// Secret store server to start first
        #[arg(long)]
        store_cmd: Option<String>,

        /// Arguments for the secret store server
        #[arg(long = "store-arg", allow_hyphen_values = true)]
        store_args: Vec<String>,

        /// Also write the scoped application token to this file
        #[arg(long)]
        app_token_file: Option<PathBuf>,

        /// Application command line
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

/// Token selection for consumer commands
#[derive(Args, Debug, Clone)]
pub struct TokenArgs {
    /// Scoped token to authenticate with
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Path to file containing the scoped token
    #[arg(long)]
    pub token_file: Option<PathBuf>,
}

/// Run CLI commands and return the process exit code
pub async fn run_cli() -> Result<i32> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let mut overrides = ConfigOverrides {
        store_address: cli.store_address,
        state_dir: cli.state_dir,
        kv_mount: cli.kv_mount,
        ..Default::default()
    };

    match cli.command {
        Commands::Bootstrap { app_token_file } => {
            overrides.app_token_file = app_token_file;
            handle_bootstrap(load_config(overrides)?).await
        }
        Commands::Status => handle_status(load_config(overrides)?).await,
        Commands::WaitReady { services, token, attempts } => {
            overrides.wait_attempts = attempts;
            handle_wait_ready(load_config(overrides)?, &services, token).await
        }
        Commands::Fetch { service, format, token } => {
            handle_fetch(load_config(overrides)?, &service, format, token).await
        }
        Commands::Run { store_cmd, store_args, app_token_file, command } => {
            overrides.app_token_file = app_token_file;
            let store = store_cmd.map(|program| ProcessSpec { program, args: store_args });
            handle_run(load_config(overrides)?, store, &command).await
        }
    }
}

fn connect(config: &BootstrapConfig) -> Result<Arc<dyn SecretStore>> {
    let store = HttpSecretStore::new(config.http_store_config())
        .with_context(|| format!("Failed to create store client for {}", config.store_address))?;
    Ok(Arc::new(store))
}

async fn handle_bootstrap(config: BootstrapConfig) -> Result<i32> {
    log_config_info(&config);
    let controller = BootstrapController::from_config(connect(&config)?, &config);

    let report = controller.run(&CredentialSource::from_env()).await?;
    print_json(&report)?;
    Ok(0)
}

async fn handle_status(config: BootstrapConfig) -> Result<i32> {
    let controller = BootstrapController::from_config(connect(&config)?, &config);
    let inspection = controller.inspect().await?;
    print_json(&inspection)?;
    Ok(if inspection.consistent { 0 } else { 1 })
}

async fn handle_wait_ready(
    config: BootstrapConfig,
    services: &[String],
    token: TokenArgs,
) -> Result<i32> {
    let token = resolve_token(token.token, token.token_file, &config.state_dir)?;
    let store = connect(&config)?;
    let registry = config.registry();

    let ready =
        wait_for_credentials(store.as_ref(), &token, &registry, services, &config.wait_retry)
            .await?;

    let names: Vec<&String> = ready.records.keys().collect();
    info!(services = ?names, "All requested credentials are ready");
    print_json(&names)?;
    Ok(0)
}

async fn handle_fetch(
    config: BootstrapConfig,
    service: &str,
    format: RecordFormat,
    token: TokenArgs,
) -> Result<i32> {
    let registry = config.registry();
    let credentials = registry
        .service(service)
        .with_context(|| format!("Unknown service '{}'", service))?
        .clone();

    let token = resolve_token(token.token, token.token_file, &config.state_dir)?;
    let store = connect(&config)?;

    let ready = wait_for_credentials(
        store.as_ref(),
        &token,
        &registry,
        &[service.to_string()],
        &config.wait_retry,
    )
    .await?;
    let fields = ready
        .record(service)
        .with_context(|| format!("No record returned for '{}'", service))?;

    print_record(&credentials, fields, format)?;
    Ok(0)
}

async fn handle_run(
    config: BootstrapConfig,
    store: Option<ProcessSpec>,
    command: &[String],
) -> Result<i32> {
    log_config_info(&config);
    let app = ProcessSpec::from_argv(command)?;
    let controller = BootstrapController::from_config(connect(&config)?, &config);

    let launcher = Launcher::new(store, app, config.store_address.clone());
    let code = launcher.run(&controller, &CredentialSource::from_env()).await?;
    Ok(code)
}
