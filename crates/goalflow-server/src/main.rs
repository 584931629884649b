use anyhow::{Context, Result};
use goalflow_server::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::load().context("Failed to load configuration")?;

    let monitoring = config.monitoring();
    goalflow_monitoring::init_logging(&monitoring).context("Failed to initialize logging")?;
    goalflow_monitoring::init_metrics(&monitoring).context("Failed to initialize metrics")?;

    goalflow_server::run(config).await.context("Server error")?;

    Ok(())
}
