use anyhow::Result;

use sweep_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("sweep-daemon")?;
    sweep_daemon::server::run().await
}
