//! Acquisition and supervision of a bitcoind daemon
//!
//! ## Features
//!
//! - **Verified acquisition**: Locate the release archive for this platform,
//!   stream it over HTTP or from a torrent's peers and web seeds, hash it while extracting
//!   and only install the daemon if the digest matches the pinned manifest
//! - **Binary cache**: Verified binaries are kept per version, so reinstalling
//!   a cached version makes no network calls
//! - **Process supervision**: Spawn bitcoind with generated flags and random
//!   RPC credentials, classify startup failures, drain unclaimed output
//! - **Readiness**: A memoized wait for the RPC server, cancelled by process exit
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    node module                          │
//! ├─────────────────────────────────────────────────────────┤
//! │  config.rs     - Settings, network, pinned constants    │
//! │  locator.rs    - Platform detection and archive naming  │
//! │  manifest.rs   - SHA256SUMS parsing                     │
//! │  downloader.rs - Transport trait, HTTP transport        │
//! │  torrent.rs    - Torrent descriptor, swarm transport    │
//! │  tracker.rs    - HTTP/UDP tracker announces             │
//! │  peer.rs       - Peer wire protocol, piece download     │
//! │  hasher.rs     - SHA256 verification                    │
//! │  extractor.rs  - tar.gz single-entry extraction         │
//! │  installer.rs  - Streaming verify + extract + promote   │
//! │  cache.rs      - Version-keyed binary cache             │
//! │  progress.rs   - Download stage and byte accounting     │
//! │  flags.rs      - Launch options and flag transform      │
//! │  manager.rs    - Process lifecycle and handle           │
//! │  output.rs     - stdout/stderr buffering and drain      │
//! │  readiness.rs  - RPC readiness polling                  │
//! │  rpc.rs        - JSON-RPC client                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod downloader;
pub mod extractor;
pub mod flags;
pub mod hasher;
pub mod installer;
pub mod locator;
pub mod manager;
pub mod manifest;
pub mod output;
pub mod peer;
pub mod progress;
pub mod readiness;
pub mod rpc;
pub mod torrent;
pub mod tracker;

// Re-export key types for convenience
pub use config::{Network, Settings, TransportKind};
pub use downloader::{transport_for, HttpTransport, Transport};
pub use flags::{to_flags, LaunchOptions, OptionValue};
pub use installer::{install, install_pinned, InstallOutcome};
pub use locator::{ArtifactDescriptor, Platform};
pub use manager::{node, Launcher, NodeHandle, ReadyFuture};
pub use output::DaemonOutput;
pub use readiness::ReadinessStats;
pub use rpc::{ReadinessProbe, RpcClient};
pub use torrent::TorrentTransport;
