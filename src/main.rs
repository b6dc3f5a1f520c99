//! supercall-core — places and supervises outbound AI-persona phone calls.
//!
//! Usage: supercall-core
//!
//! Configuration is loaded from the path in `SUPERCALL_CONFIG` (TOML), with
//! secret fields further overridable from the environment. See
//! `supercall_core::config::Config` for the full option table.

use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = supercall_core::app::run().await {
        error!("fatal error: {e}");
        std::process::exit(1);
    }

    Ok(())
}
