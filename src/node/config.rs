//! Runtime settings and pinned constants
//!
//! Settings come from the environment; the version pin and checksum
//! manifest come from the resources directory shipped with the crate.

use super::flags::LaunchOptions;
use crate::error::{NodeError, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Upstream product prefix used in archive names
pub const PRODUCT: &str = "bitcoin";

/// Daemon executable name
pub const DAEMON_NAME: &str = "bitcoind";

/// Default base URL for direct downloads
pub const DEFAULT_DOWNLOAD_URL: &str = "https://bitcoincore.org/bin";

/// RPC port assigned to regtest nodes when the caller gives none
pub const REGTEST_DEFAULT_RPC_PORT: u16 = 18332;

/// Default readiness deadline
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed delay between readiness attempts
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Exits inside this window are classified as startup failures
pub const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Unclaimed stdout/stderr are drained after this delay
pub const STREAM_DRAIN_DELAY: Duration = Duration::from_secs(4);

const VERSION_FILE: &str = "version";
/// Checksum manifest name, locally and upstream
pub const MANIFEST_FILE: &str = "SHA256SUMS.asc";
const TORRENT_FILE: &str = "bitcoin.torrent";

/// Network the daemon runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Get the network name as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    /// Network selected by the `testnet`/`regtest` switches; regtest wins
    pub fn from_options(options: &LaunchOptions) -> Self {
        if options.flag("regtest") {
            Network::Regtest
        } else if options.flag("testnet") {
            Network::Testnet
        } else {
            Network::Mainnet
        }
    }

    /// Daemon's own default RPC port for this network
    pub fn default_rpc_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8332,
            Network::Testnet => 18332,
            Network::Regtest => 18443,
        }
    }
}

/// Which transport the acquisition pipeline uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Torrent descriptor shipped in the resources directory
    #[default]
    Torrent,
    /// Plain HTTPS GET against the download base URL
    Http,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "torrent" => Ok(TransportKind::Torrent),
            "http" | "https" => Ok(TransportKind::Http),
            other => Err(format!("unknown transport \"{}\" (expected torrent or http)", other)),
        }
    }
}

/// Settings shared by the fetch and launch entry points
#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory holding the version pin, checksum manifest and torrent
    pub resources_dir: PathBuf,
    /// Where the working bitcoind binary lives
    pub binary_path: PathBuf,
    /// Root of the per-user cache
    pub cache_root: PathBuf,
    /// Mirror daemon stdout/stderr to ours
    pub mirror_output: bool,
    pub transport: TransportKind,
    pub download_url: String,
}

impl Settings {
    /// Load settings from the environment
    pub fn from_env() -> Result<Self> {
        let resources_dir = std::env::var_os("BITCOIND_RESOURCES")
            .map(PathBuf::from)
            .unwrap_or_else(default_resources_dir);

        let binary_path = std::env::var_os("BITCOIND_BINARY")
            .map(PathBuf::from)
            .unwrap_or_else(|| resources_dir.join(DAEMON_NAME));

        let cache_root = std::env::var_os("BITCOIND_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_root);

        let mirror_output = std::env::var("BITCOIND_LOG")
            .map(|v| !v.is_empty())
            .unwrap_or(false);

        let transport = match std::env::var("BITCOIND_TRANSPORT") {
            Ok(value) => value
                .parse()
                .map_err(|e: String| NodeError::transport(e))?,
            Err(_) => TransportKind::default(),
        };

        let download_url = std::env::var("BITCOIND_DOWNLOAD_URL")
            .unwrap_or_else(|_| DEFAULT_DOWNLOAD_URL.to_string());

        Ok(Self {
            resources_dir,
            binary_path,
            cache_root,
            mirror_output,
            transport,
            download_url,
        })
    }

    /// Settings rooted at an explicit resources directory, ignoring the environment
    pub fn with_resources(resources_dir: impl Into<PathBuf>) -> Self {
        let resources_dir = resources_dir.into();
        Self {
            binary_path: resources_dir.join(DAEMON_NAME),
            resources_dir,
            cache_root: default_cache_root(),
            mirror_output: false,
            transport: TransportKind::default(),
            download_url: DEFAULT_DOWNLOAD_URL.to_string(),
        }
    }

    pub fn version_path(&self) -> PathBuf {
        self.resources_dir.join(VERSION_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.resources_dir.join(MANIFEST_FILE)
    }

    pub fn torrent_path(&self) -> PathBuf {
        self.resources_dir.join(TORRENT_FILE)
    }

    /// Read the pinned upstream version
    pub fn pinned_version(&self) -> Result<String> {
        read_version_pin(&self.version_path())
    }

    /// Version-keyed location of the cached binary
    pub fn cached_binary_path(&self, version: &str) -> PathBuf {
        self.cache_root.join(format!("{}_{}", DAEMON_NAME, version))
    }
}

/// Read a version pin file: a single line holding the exact upstream version
pub fn read_version_pin(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| NodeError::io(format!("Failed to read {}", path.display()), e))?;
    let version = contents.trim();
    if version.is_empty() {
        return Err(NodeError::io(
            format!("Version pin {} is empty", path.display()),
            std::io::Error::from(std::io::ErrorKind::InvalidData),
        ));
    }
    Ok(version.to_string())
}

fn default_resources_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("resources")
}

fn default_cache_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bitcoind-launcher")
}
