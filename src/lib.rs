//! Fetch, verify and supervise a Bitcoin Core full-node daemon
//!
//! The acquisition side downloads the release archive for the pinned
//! version, checks it against the pinned SHA256SUMS manifest while it
//! streams, and installs `bitcoind` from it. The supervision side spawns that
//! binary with generated flags and waits for its RPC server.
//!
//! ```no_run
//! use bitcoind_launcher::{node, LaunchOptions};
//!
//! # async fn run() -> bitcoind_launcher::Result<()> {
//! let daemon = node(LaunchOptions::new().with("regtest", true))?;
//! daemon.ready(None).await?;
//! let info = daemon.rpc().get_network_info().await?;
//! println!("{}", info["subversion"]);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod logging;
pub mod node;
pub mod update;

pub use error::{NodeError, Result, INTEGRITY_FAILURE_MESSAGE};
pub use node::{node, LaunchOptions, Launcher, NodeHandle};
