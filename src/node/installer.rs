//! Verified acquisition of the bitcoind binary
//!
//! ```text
//! cache hit? ──yes──> copy to binary path, done (no network)
//!     │ no
//! manifest lookup ──> transport.open ──> chunk ──┬──> SHA-256
//!                                                └──> gunzip/untar (blocking thread)
//! digest == manifest? ──no──> IntegrityMismatch (scratch dir removed)
//!     │ yes
//! rename into place, remove scratch dir, copy to cache
//! ```
//!
//! The manifest and the archive come from different channels, so both
//! would have to be compromised for a tampered binary to be installed.

use super::cache;
use super::config::Settings;
use super::downloader::{transport_for, ArtifactStream, Transport};
use super::extractor::{extract_entry, make_executable, ChunkReader};
use super::hasher::{digests_match, StreamHasher};
use super::locator::{ArtifactDescriptor, Platform};
use super::manifest::ChecksumManifest;
use super::progress::{DownloadProgress, DownloadStage};
use crate::error::{NodeError, Result};
use bytes::Bytes;
use futures_util::StreamExt;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Chunks buffered between the download loop and the extractor thread
const CHANNEL_DEPTH: usize = 16;

/// How an install finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Copied from the version-keyed cache
    Cached,
    /// Downloaded and verified
    Downloaded { digest: String, bytes: u64 },
}

impl fmt::Display for InstallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallOutcome::Cached => write!(f, "bitcoind restored from cache"),
            InstallOutcome::Downloaded { digest, bytes } => write!(
                f,
                "verified hash of Bitcoin Core binaries ({} bytes, sha256 {})",
                bytes, digest
            ),
        }
    }
}

/// Install the binary for `artifact` at `settings.binary_path`
pub async fn install(
    artifact: &ArtifactDescriptor,
    settings: &Settings,
    transport: &dyn Transport,
) -> Result<InstallOutcome> {
    let mut progress = DownloadProgress::new(&artifact.filename);

    progress.set_stage(DownloadStage::CheckingCache);
    let cached = settings.cached_binary_path(&artifact.version);
    if cache::restore(&cached, &settings.binary_path)? {
        progress.set_stage(DownloadStage::Complete);
        return Ok(InstallOutcome::Cached);
    }

    let manifest = ChecksumManifest::load(&settings.manifest_path())?;
    let expected = manifest
        .expected_for(&artifact.filename)
        .ok_or_else(|| NodeError::MissingChecksum {
            filename: artifact.filename.clone(),
        })?
        .to_string();

    log::info!(
        "Downloading {} v{} via {}",
        artifact.filename,
        artifact.version,
        transport.name()
    );

    let result = download_and_install(artifact, settings, transport, &expected, &mut progress).await;
    if result.is_err() {
        progress.set_stage(DownloadStage::Failed);
    }
    result
}

/// Install the version pinned in the resources directory
///
/// Platform detection happens first, so an unsupported host fails before
/// any file or network access.
pub async fn install_pinned(settings: &Settings) -> Result<InstallOutcome> {
    let platform = Platform::current()?;
    let artifact = ArtifactDescriptor::new(platform, settings.pinned_version()?)?;
    let transport = transport_for(settings)?;
    install(&artifact, settings, transport.as_ref()).await
}

async fn download_and_install(
    artifact: &ArtifactDescriptor,
    settings: &Settings,
    transport: &dyn Transport,
    expected: &str,
    progress: &mut DownloadProgress,
) -> Result<InstallOutcome> {
    let mut session = DownloadSession::new(artifact, &settings.binary_path)?;

    let stream = transport.open(artifact).await?;
    progress.set_stage(DownloadStage::Downloading);
    let extracted = session.consume(stream, progress).await?;

    progress.set_stage(DownloadStage::Verifying);
    let actual = session.finalize_digest();
    if !digests_match(&actual, expected) {
        log::error!(
            "Hash mismatch for {}: expected {}, got {}",
            artifact.filename,
            expected,
            actual
        );
        return Err(NodeError::IntegrityMismatch {
            filename: artifact.filename.clone(),
            expected: expected.to_string(),
            actual,
        });
    }
    log::info!("Verified hash of {}", artifact.filename);

    // Only a verified archive gets to report extraction problems
    extracted?;

    progress.set_stage(DownloadStage::Installing);
    let bytes = progress.downloaded;
    session.promote(&settings.binary_path)?;
    cache::store(
        &settings.binary_path,
        &settings.cached_binary_path(&artifact.version),
    )?;

    progress.set_stage(DownloadStage::Complete);
    Ok(InstallOutcome::Downloaded {
        digest: actual,
        bytes,
    })
}

/// State of one acquisition attempt
///
/// The scratch directory lives next to the final binary so the promote step
/// is a same-filesystem rename. It is removed when the session is dropped,
/// whichever way the attempt ends.
pub struct DownloadSession {
    hasher: StreamHasher,
    entry_path: String,
    extracted: PathBuf,
    scratch: TempDir,
}

impl DownloadSession {
    pub fn new(artifact: &ArtifactDescriptor, binary_path: &Path) -> Result<Self> {
        let parent = binary_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|e| NodeError::io(format!("Failed to create {}", parent.display()), e))?;

        let scratch = tempfile::Builder::new()
            .prefix(".bitcoind-extract-")
            .tempdir_in(parent)
            .map_err(|e| NodeError::io("Failed to create extraction directory", e))?;

        let entry_path = artifact.daemon_entry_path();
        let extracted = scratch.path().join(&entry_path);

        Ok(Self {
            hasher: StreamHasher::new(),
            entry_path,
            extracted,
            scratch,
        })
    }

    /// Hash every chunk and feed it to the extractor thread
    ///
    /// The outer result is the transport's; the inner one is extraction's,
    /// which only matters once the digest has been checked.
    pub async fn consume(
        &mut self,
        stream: ArtifactStream,
        progress: &mut DownloadProgress,
    ) -> Result<Result<()>> {
        progress.total = stream.total_len;

        let (tx, rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
        let entry_path = self.entry_path.clone();
        let target = self.extracted.clone();
        let extractor =
            tokio::task::spawn_blocking(move || extract_entry(ChunkReader::new(rx), &entry_path, &target));

        let mut sender = Some(tx);
        let mut body = stream.body;
        let mut transport_error = None;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    transport_error = Some(e);
                    break;
                }
            };

            self.hasher.update(&chunk);
            progress.record(chunk.len());

            if let Some(tx) = &sender {
                // The extractor hangs up once it has the daemon; keep hashing
                if tx.send(chunk).await.is_err() {
                    sender = None;
                }
            }
        }
        drop(sender);

        let extracted = extractor
            .await
            .map_err(|e| NodeError::Extraction(format!("extractor thread failed: {}", e)))
            .and_then(|result| result);

        match transport_error {
            Some(e) => Err(e),
            None => Ok(extracted),
        }
    }

    /// Hex digest of everything consumed so far
    pub fn finalize_digest(&mut self) -> String {
        std::mem::take(&mut self.hasher).finalize_hex()
    }

    /// Move the extracted daemon to `binary_path` and remove the scratch dir
    pub fn promote(self, binary_path: &Path) -> Result<()> {
        fs::rename(&self.extracted, binary_path).map_err(|e| {
            NodeError::io(format!("Failed to move binary to {}", binary_path.display()), e)
        })?;
        make_executable(binary_path)?;

        self.scratch
            .close()
            .map_err(|e| NodeError::io("Failed to remove extraction directory", e))?;

        log::info!("Installed {}", binary_path.display());
        Ok(())
    }
}
