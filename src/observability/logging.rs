//! # Structured Logging
//!
//! Span macros and startup logging for the bootstrap process. Every run of
//! the controller or the readiness gate is wrapped in a span carrying a
//! `run_id`, so the lines of one invocation can be grouped in aggregated
//! container logs.

/// Create a tracing span for one bootstrap or readiness run.
///
/// ```rust,ignore
/// let span = bootstrap_span!("bootstrap", store = %address);
/// ```
#[macro_export]
macro_rules! bootstrap_span {
    ($operation:expr) => {
        tracing::info_span!(
            "bootstrap_run",
            operation = %$operation,
            run_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::info_span!(
            "bootstrap_run",
            operation = %$operation,
            run_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for a single secret store request
#[macro_export]
macro_rules! store_span {
    ($operation:expr) => {
        tracing::debug_span!(
            "store_call",
            operation = %$operation,
            call_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "store_call",
            operation = %$operation,
            call_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::BootstrapConfig) {
    tracing::info!(
        store_address = %config.store_address,
        namespace = ?config.namespace,
        kv_mount = %config.kv_mount,
        state_dir = %config.state_dir.display(),
        policy = %config.policy_name,
        app_token_file = ?config.app_token_file,
        wait_attempts = config.wait_retry.max_attempts,
        call_attempts = config.call_retry.max_attempts,
        "Bootstrap configuration"
    );
}
