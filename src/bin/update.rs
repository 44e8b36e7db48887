//! bitcoind-update
//!
//! `bitcoind-update <version>` pins a Bitcoin Core release: refreshes the
//! checksum manifest, torrent descriptor and version pin in the resources
//! directory, then installs the binary.

use anyhow::Context;
use bitcoind_launcher::logging::{init_logger, LoggerOptions};
use bitcoind_launcher::node::installer::install_pinned;
use bitcoind_launcher::node::Settings;
use bitcoind_launcher::update::update_reference_files;
use bitcoind_launcher::{NodeError, INTEGRITY_FAILURE_MESSAGE};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_logger(LoggerOptions::from_env()) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let Some(version) = std::env::args().nth(1) else {
        eprintln!("Must specify Bitcoin Core version");
        return ExitCode::FAILURE;
    };

    match run(&version).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<NodeError>() {
                Some(NodeError::TransportFailure {
                    status: Some(status),
                    ..
                }) => eprintln!("Request failed with status {}", status),
                Some(err) if err.is_integrity_failure() => {
                    eprintln!("{}", INTEGRITY_FAILURE_MESSAGE)
                }
                _ => eprintln!("{:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(version: &str) -> anyhow::Result<()> {
    let settings = Settings::from_env().context("Invalid configuration")?;

    let update = update_reference_files(&settings, version).await?;
    println!("updated SHA256SUMS file ({} checksums)", update.checksums);
    println!("updated torrent file");
    println!("updated version file");
    if update.is_downgrade() {
        log::warn!(
            "Pinned {} is older than the previous pin {}",
            update.version,
            update.previous.as_deref().unwrap_or_default()
        );
    }

    let outcome = install_pinned(&settings)
        .await
        .with_context(|| format!("Failed to install {}", settings.binary_path.display()))?;
    println!("{}", outcome);
    Ok(())
}
