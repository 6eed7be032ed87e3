//! Durable local state of the bootstrap flow.
//!
//! Holds the unseal key, the root token and the scoped application token in
//! `<state_dir>/bootstrap-state.json`. The existence of that file is the
//! marker for "this store has been initialized". The file has a single
//! writer (the controller) and is always replaced atomically: the new
//! content is written to a temporary file in the same directory, flushed to
//! disk, and renamed over the old one. A crash mid-write leaves the previous
//! version intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::secrets::{exposed, SecretString};

/// File name of the state document inside the state directory.
pub const STATE_FILE_NAME: &str = "bootstrap-state.json";

const STATE_VERSION: u32 = 1;

/// Values captured by the bootstrap flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,

    /// When the store was initialized
    pub initialized_at: DateTime<Utc>,

    #[serde(with = "exposed", default, skip_serializing_if = "Option::is_none")]
    pub unseal_key: Option<SecretString>,

    #[serde(with = "exposed", default, skip_serializing_if = "Option::is_none")]
    pub root_token: Option<SecretString>,

    #[serde(with = "exposed", default, skip_serializing_if = "Option::is_none")]
    pub app_token: Option<SecretString>,

    /// Policy the application token was created against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_token_created_at: Option<DateTime<Utc>>,
}

impl PersistedState {
    /// State right after initialization, before a scoped token exists.
    pub fn initialized(unseal_key: SecretString, root_token: SecretString) -> Self {
        Self {
            version: STATE_VERSION,
            initialized_at: Utc::now(),
            unseal_key: Some(unseal_key),
            root_token: Some(root_token),
            app_token: None,
            app_policy: None,
            app_token_created_at: None,
        }
    }

    /// Record (or replace) the scoped application token.
    pub fn with_app_token(mut self, token: SecretString, policy: impl Into<String>) -> Self {
        self.app_token = Some(token);
        self.app_policy = Some(policy.into());
        self.app_token_created_at = Some(Utc::now());
        self
    }
}

/// Reader/writer for the state file.
#[derive(Debug, Clone)]
pub struct LocalStateStore {
    dir: PathBuf,
}

impl LocalStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Full path of the state document.
    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    /// Load the state, or `None` if the store was never initialized from here.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        let path = self.path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No local bootstrap state");
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::io(format!("Failed to read state file {}", path.display()), e))
            }
        };

        let state: PersistedState = serde_json::from_str(&contents).map_err(|e| {
            Error::StateCorrupted { path: path.display().to_string(), message: e.to_string() }
        })?;

        if state.version != STATE_VERSION {
            return Err(Error::StateCorrupted {
                path: path.display().to_string(),
                message: format!("unsupported state version {}", state.version),
            });
        }

        Ok(Some(state))
    }

    /// Atomically replace the state document.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let contents = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path(), &contents)?;
        info!(
            path = %self.path().display(),
            has_unseal_key = state.unseal_key.is_some(),
            has_root_token = state.root_token.is_some(),
            has_app_token = state.app_token.is_some(),
            "Persisted bootstrap state"
        );
        Ok(())
    }
}

/// Write `contents` to `path` through a temporary file and a rename.
///
/// The file is created with mode 0600 on unix.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .map_err(|e| Error::io(format!("Failed to create directory {}", dir.display()), e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".bootstrap-")
        .suffix(".tmp")
        .tempfile_in(&dir)
        .map_err(|e| Error::io(format!("Failed to create temp file in {}", dir.display()), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
            .map_err(|e| Error::io("Failed to restrict temp file permissions", e))?;
    }

    tmp.write_all(contents)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io(format!("Failed to write {}", path.display()), e))?;

    tmp.persist(path)
        .map_err(|e| Error::io(format!("Failed to replace {}", path.display()), e.error))?;

    // Make the rename itself durable.
    #[cfg(unix)]
    {
        if let Ok(handle) = fs::File::open(&dir) {
            let _ = handle.sync_all();
        }
    }

    Ok(())
}
