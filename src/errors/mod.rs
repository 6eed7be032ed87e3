//! # Error Handling
//!
//! Error taxonomy for the bootstrap flow. Every variant is either transient
//! (retried locally by the component that issued the call, within a bounded
//! budget) or fatal (propagated to the top of the controller and reported
//! with the phase it happened in).

use std::fmt;

/// Custom result type for bootstrap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Phase of the bootstrap flow an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    WaitForStore,
    Initialize,
    Unseal,
    Login,
    Configure,
    Publish,
    Readiness,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::WaitForStore => write!(f, "wait_for_store"),
            Phase::Initialize => write!(f, "initialize"),
            Phase::Unseal => write!(f, "unseal"),
            Phase::Login => write!(f, "login"),
            Phase::Configure => write!(f, "configure"),
            Phase::Publish => write!(f, "publish"),
            Phase::Readiness => write!(f, "readiness"),
        }
    }
}

/// Main error type for the bootstrap crate
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The secret store is not accepting connections yet.
    #[error("Secret store unreachable at {address}: {message}")]
    Unreachable { address: String, message: String },

    /// Initialization was attempted against a store that is already initialized,
    /// or local state records a previous initialization.
    #[error("Secret store already initialized: {message}")]
    AlreadyInitialized { message: String },

    /// The store is sealed and no unseal key was persisted locally.
    #[error(
        "Secret store is sealed but no unseal key is persisted in {state_path}; \
         a single-share store cannot be recovered without it"
    )]
    LostUnsealKey { state_path: String },

    /// The store is initialized but no root token was persisted locally.
    #[error(
        "Secret store is initialized but no root token is persisted in {state_path}; \
         cannot configure policies or publish credentials"
    )]
    LostRootToken { state_path: String },

    /// Unseal was accepted but the store still reports sealed.
    #[error("Secret store still sealed after unseal (progress {progress}/{threshold})")]
    UnsealIncomplete { progress: u32, threshold: u32 },

    /// A required field of a credential record is absent from the credential source.
    #[error("Missing required field '{field}' for {service} credentials (set {env_var})")]
    MissingRequiredCredentialField { service: String, field: String, env_var: String },

    /// A remote call failed in a way that may succeed on retry.
    #[error("Remote call '{operation}' failed: {message}")]
    RemoteWriteFailed { operation: String, message: String },

    /// The retry budget for a transient failure was used up.
    #[error("Gave up on '{operation}' after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The presented token lacks the capability for the call.
    #[error("Permission denied for '{operation}': {message}")]
    PermissionDenied { operation: String, message: String },

    /// A credential record is absent or incomplete; dependents keep polling.
    #[error("Credentials at {path} not ready: {reason}")]
    NotReady { path: String, reason: String },

    /// No secret stored at the requested path.
    #[error("Secret not found at {path}")]
    SecretNotFound { path: String },

    /// The store rejected a request (non-retryable client error).
    #[error("Secret store rejected '{operation}' (status {status}): {message}")]
    Rejected { operation: String, status: u16, message: String },

    /// Persisted local state could not be understood.
    #[error("Local state at {path} is corrupted: {message}")]
    StateCorrupted { path: String, message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A fatal error annotated with the bootstrap phase it occurred in.
    #[error("Bootstrap failed during {phase}: {source}")]
    Phase {
        phase: Phase,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an unreachable error
    pub fn unreachable<A: Into<String>, M: Into<String>>(address: A, message: M) -> Self {
        Self::Unreachable { address: address.into(), message: message.into() }
    }

    /// Create an already-initialized error
    pub fn already_initialized<S: Into<String>>(message: S) -> Self {
        Self::AlreadyInitialized { message: message.into() }
    }

    /// Create a transient remote failure
    pub fn remote_write_failed<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::RemoteWriteFailed { operation: operation.into(), message: message.into() }
    }

    /// Create a missing credential field error
    pub fn missing_field<S: Into<String>, F: Into<String>, E: Into<String>>(
        service: S,
        field: F,
        env_var: E,
    ) -> Self {
        Self::MissingRequiredCredentialField {
            service: service.into(),
            field: field.into(),
            env_var: env_var.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create an I/O error with context
    pub fn io<S: Into<String>>(context: S, source: std::io::Error) -> Self {
        Self::Io { context: context.into(), source }
    }

    /// Attach the bootstrap phase to an error. Already-annotated errors keep
    /// their original phase.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Self::Phase { .. } => self,
            other => Self::Phase { phase, source: Box::new(other) },
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable { .. } | Self::RemoteWriteFailed { .. } | Self::NotReady { .. }
        )
    }

    /// The underlying error with phase and retry wrappers removed.
    pub fn root(&self) -> &Error {
        match self {
            Self::Phase { source, .. } | Self::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(Error::unreachable("http://vault:8200", "connection refused").is_retryable());
        assert!(Error::remote_write_failed("write_secret", "503").is_retryable());
        assert!(!Error::already_initialized("store reports initialized").is_retryable());
        assert!(!Error::LostUnsealKey { state_path: "/state".into() }.is_retryable());
        assert!(!Error::missing_field("database", "password", "DB_PASSWORD").is_retryable());
    }

    #[test]
    fn test_phase_annotation_is_not_nested() {
        let err = Error::LostRootToken { state_path: "/var/lib/state.json".into() }
            .in_phase(Phase::Login)
            .in_phase(Phase::Publish);

        match &err {
            Error::Phase { phase, .. } => assert_eq!(*phase, Phase::Login),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(err.root(), Error::LostRootToken { .. }));
        assert!(err.to_string().contains("during login"));
        assert!(err.to_string().contains("/var/lib/state.json"));
    }

    #[test]
    fn test_root_unwraps_retries_exhausted() {
        let err = Error::RetriesExhausted {
            operation: "status".into(),
            attempts: 3,
            source: Box::new(Error::unreachable("http://vault:8200", "refused")),
        };
        assert!(matches!(err.root(), Error::Unreachable { .. }));
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[test]
    fn test_missing_field_display_names_env_var() {
        let err = Error::missing_field("database", "password", "DB_PASSWORD");
        assert_eq!(
            err.to_string(),
            "Missing required field 'password' for database credentials (set DB_PASSWORD)"
        );
    }
}
