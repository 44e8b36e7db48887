//! Error taxonomy shared by the acquisition and supervision pipelines
//!
//! Every variant is `Clone` so that a single readiness outcome can be handed
//! to each caller awaiting the same memoized future.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by fetching, verifying and supervising bitcoind
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// The operating system has no published release archive
    #[error("Platform \"{os}\" is not supported")]
    UnsupportedPlatform { os: String },

    /// The OS is supported but this CPU architecture is not
    #[error("Arch \"{arch}\" not supported on {os}")]
    UnsupportedArchitecture { os: String, arch: String },

    /// The artifact could not be fetched
    #[error("{}", transport_message(.status, .cause))]
    TransportFailure { status: Option<u16>, cause: String },

    /// The downloaded archive does not hash to the pinned checksum
    #[error("hash of {filename} did not match: expected {expected}, got {actual}")]
    IntegrityMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    /// The checksum manifest has no entry for the archive
    #[error("no checksum entry for {filename} in manifest")]
    MissingChecksum { filename: String },

    /// Not a Bitcoin Core release version
    #[error("Invalid Bitcoin Core version \"{version}\"")]
    InvalidVersion { version: String },

    /// A launch option key contains uppercase characters
    #[error("Options must be lowercase (got \"{key}\")")]
    InvalidOptionKey { key: String },

    /// The daemon exited inside the startup grace window; carries its stderr verbatim
    #[error("{stderr}")]
    ProcessStartupFailure { stderr: String },

    /// The daemon exited after the startup grace window
    #[error("bitcoind exited with {}", exit_label(.code))]
    UnexpectedExit { code: Option<i32> },

    /// RPC never answered within the deadline
    #[error("Timed out while waiting for bitcoind RPC after {timeout:?}")]
    ReadinessTimeout { timeout: Duration },

    /// The archive could not be unpacked, or the daemon entry is absent
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The torrent descriptor is malformed or does not list the archive
    #[error("torrent descriptor: {0}")]
    Torrent(String),

    /// A JSON-RPC call failed
    #[error("RPC: {0}")]
    Rpc(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl NodeError {
    /// Wrap an I/O error with a short description of what was being done
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        NodeError::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Transport failure without an HTTP status
    pub fn transport(cause: impl Into<String>) -> Self {
        NodeError::TransportFailure {
            status: None,
            cause: cause.into(),
        }
    }

    /// True for the security-relevant verification failure
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, NodeError::IntegrityMismatch { .. })
    }
}

fn transport_message(status: &Option<u16>, cause: &str) -> String {
    match status {
        Some(code) => format!("Request failed with status {}: {}", code, cause),
        None => format!("Request failed: {}", cause),
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

/// Printed by the binaries before exiting on a hash mismatch
pub const INTEGRITY_FAILURE_MESSAGE: &str =
    "ERROR: hash of downloaded Bitcoin Core binaries did not match";

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, NodeError>;
