//! Snapshot controller entry point.

use anyhow::Result;

use checkout_fabric::config::ServiceConfig;
use checkout_fabric::logging::init_logging;
use checkout_fabric::snapctl::SnapshotController;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_env("snapshot-cron")?;
    let _guard = init_logging(&config.log);

    SnapshotController::new(&config).run().await;
    Ok(())
}
