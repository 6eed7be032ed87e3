use vault_bootstrap::cli::run_cli;

#[tokio::main]
async fn main() {
    // Load .env file if it exists (optional - won't fail if missing)
    // This must happen before any config is read from environment
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    match run_cli().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::error!(error = %e, "vault-bootstrap failed");
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
