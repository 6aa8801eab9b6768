//! flork operator - lifecycle management of Flink jobs and sessions

use clap::Parser;
use flork::{crd_manifests, runner, Cli};
use flork_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let yaml = crd_manifests().map_err(|e| anyhow::anyhow!("Failed to serialize CRDs: {}", e))?;
        println!("{yaml}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: cli.json_logs,
        filter: None,
    })?;

    runner::run_controller(&cli)
        .await
        .map_err(|e| anyhow::anyhow!("Controller failed: {}", e))
}
