//! CLI entry point.
//!
//! Initializes tracing from `RUST_LOG`, `LOG_JSON` and `LOG_FILE`, then hands
//! over to [`cli::run`].

use dex_state_sync::{cli, observability};
use eyre::WrapErr;
use tracing::error;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let log_level = std::env::var("RUST_LOG").ok();
    let log_file = std::env::var("LOG_FILE").ok().map(std::path::PathBuf::from);
    let json_output = std::env::var("LOG_JSON")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    let _guard = observability::init_tracing(log_level, log_file, json_output)
        .wrap_err("Failed to initialize tracing")?;

    if let Err(e) = cli::run().await {
        error!(error = %e, "Application error");
        return Err(e).wrap_err("dex-state-sync failed");
    }

    Ok(())
}
