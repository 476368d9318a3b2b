//! Smoke run against real hardware: bring the session up from a config
//! file, push one frequency command down the cloud path and read the
//! result back off the drive.

use std::time::Duration;

use anyhow::{Context, Result};

use hilbridge::command::CommandKind;
use hilbridge::config::HarnessConfig;
use hilbridge::orchestrator::Session;

#[tokio::main]
async fn main() -> Result<()> {
    hilbridge::logging::init("info");

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "hilbridge.yaml".to_string());
    let config = HarnessConfig::from_file(&path)
        .with_context(|| format!("loading config from {}", path))?;

    let session = Session::setup(config).await.context("session setup")?;

    session.mark("issuing set_frequency 30 Hz");
    let mut handle = session.issue(CommandKind::SetFrequency, 30.0).await?;
    let verdict = session.expect_success(&mut handle).await;
    println!("set_frequency outcome: {}", verdict);

    let verdict = session
        .expect_register(0x1000, 3000, Duration::from_secs(10))
        .await;
    println!("register readback: {}", verdict);

    session.teardown();
    Ok(())
}
