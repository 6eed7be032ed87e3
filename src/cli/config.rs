//! Configuration and token resolution for CLI commands
//!
//! Builds the [`BootstrapConfig`] from the environment plus command-line
//! overrides, and resolves the scoped token consumers authenticate with.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::BootstrapConfig;
use crate::retry::RetryPolicy;
use crate::secrets::SecretString;
use crate::state::LocalStateStore;

/// Command-line overrides applied on top of the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub store_address: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub kv_mount: Option<String>,
    pub app_token_file: Option<PathBuf>,
    pub wait_attempts: Option<u32>,
}

/// Load, override and validate the configuration.
pub fn load_config(overrides: ConfigOverrides) -> Result<BootstrapConfig> {
    let mut config =
        BootstrapConfig::from_env().context("Failed to load configuration from environment")?;
    apply_overrides(&mut config, overrides);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn apply_overrides(config: &mut BootstrapConfig, overrides: ConfigOverrides) {
    if let Some(address) = overrides.store_address {
        config.store_address = address;
    }
    if let Some(dir) = overrides.state_dir {
        config.state_dir = dir;
    }
    if let Some(mount) = overrides.kv_mount {
        config.kv_mount = mount;
    }
    if let Some(path) = overrides.app_token_file {
        config.app_token_file = Some(path);
    }
    if let Some(attempts) = overrides.wait_attempts {
        config.wait_retry = RetryPolicy { max_attempts: attempts, ..config.wait_retry.clone() };
    }
}

/// Resolve the scoped token with priority order:
/// 1. `--token` flag (or `VAULT_TOKEN`)
/// 2. `--token-file` flag
/// 3. The scoped token persisted by a previous bootstrap in `state_dir`
pub fn resolve_token(
    token_flag: Option<String>,
    token_file_flag: Option<PathBuf>,
    state_dir: &Path,
) -> Result<SecretString> {
    if let Some(token) = token_flag.filter(|t| !t.trim().is_empty()) {
        debug!("Using token from --token flag");
        return Ok(SecretString::new(token.trim()));
    }

    if let Some(token_file) = token_file_flag {
        debug!("Reading token from file: {}", token_file.display());
        let token = std::fs::read_to_string(&token_file)
            .with_context(|| format!("Failed to read token file: {}", token_file.display()))?;
        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("Token file is empty: {}", token_file.display());
        }
        return Ok(SecretString::new(token));
    }

    let state = LocalStateStore::new(state_dir);
    if let Some(token) = state.load()?.and_then(|s| s.app_token) {
        debug!(path = %state.path().display(), "Using scoped token from bootstrap state");
        return Ok(token);
    }

    anyhow::bail!(
        "No token found. Please provide a token via:\n\
         - --token flag or VAULT_TOKEN\n\
         - --token-file flag\n\
         - a completed bootstrap in {}",
        state_dir.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PersistedState;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_resolve_token_from_flag() {
        let dir = tempfile::tempdir().unwrap();
        let token = assert_ok!(resolve_token(Some(" s.flag ".into()), None, dir.path()));
        assert_eq!(token.expose_secret(), "s.flag");
    }

    #[test]
    fn test_resolve_token_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("token");
        std::fs::write(&file, "s.file\n").unwrap();

        let token = assert_ok!(resolve_token(None, Some(file), dir.path()));
        assert_eq!(token.expose_secret(), "s.file");
    }

    #[test]
    fn test_resolve_token_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("token");
        std::fs::write(&file, "  \n").unwrap();
        assert_err!(resolve_token(None, Some(file), dir.path()));
    }

    #[test]
    fn test_resolve_token_from_state() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistedState::initialized("key".into(), "s.root".into())
            .with_app_token("s.app".into(), "app-policy".to_string());
        LocalStateStore::new(dir.path()).save(&state).unwrap();

        let token = resolve_token(None, None, dir.path()).unwrap();
        assert_eq!(token.expose_secret(), "s.app");
    }

    #[test]
    fn test_resolve_token_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_token(None, None, dir.path()).unwrap_err();
        assert!(err.to_string().contains("No token found"));
    }

    #[test]
    fn test_overrides_replace_env_values() {
        let mut config = BootstrapConfig::default();
        apply_overrides(
            &mut config,
            ConfigOverrides {
                store_address: Some("http://127.0.0.1:8200".into()),
                wait_attempts: Some(4),
                ..Default::default()
            },
        );
        assert_eq!(config.store_address, "http://127.0.0.1:8200");
        assert_eq!(config.wait_retry.max_attempts, 4);
        assert_eq!(config.kv_mount, "kv");
    }
}
