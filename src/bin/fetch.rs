//! bitcoind-fetch
//!
//! Installs the pinned bitcoind into the resources directory. Exits 0 when
//! the binary was verified or restored from cache, 1 on any failure.

use anyhow::Context;
use bitcoind_launcher::logging::{init_logger, LoggerOptions};
use bitcoind_launcher::node::installer::install_pinned;
use bitcoind_launcher::node::Settings;
use bitcoind_launcher::{NodeError, INTEGRITY_FAILURE_MESSAGE};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_logger(LoggerOptions::from_env()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.downcast_ref::<NodeError>().is_some_and(NodeError::is_integrity_failure) {
                eprintln!("{}", INTEGRITY_FAILURE_MESSAGE);
            } else {
                eprintln!("{:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("Invalid configuration")?;
    let version = settings.pinned_version()?;
    println!("installing Bitcoin Core v{}", version);

    let outcome = install_pinned(&settings)
        .await
        .with_context(|| format!("Failed to install {}", settings.binary_path.display()))?;
    println!("{}", outcome);
    Ok(())
}
