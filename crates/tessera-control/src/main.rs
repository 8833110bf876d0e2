//! Tessera control service binary.
//!
//! Runs the lifecycle manager and its periodic expiry sweep.

use tracing::info;
use tracing_subscriber::EnvFilter;

use tessera_control::{ControlConfig, ControlService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tessera_control=info".parse()?),
        )
        .init();

    info!("Tessera control service starting");

    // Load configuration
    let config = ControlConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ControlConfig::default()
    });

    info!(
        store = ?config.store.backend,
        database = %config.database.url,
        reaper_interval_secs = config.reaper.interval_secs,
        "configuration loaded"
    );

    ControlService::new(config).run().await?;

    Ok(())
}
