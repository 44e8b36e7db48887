//! Reference file refresh
//!
//! Pins a Bitcoin Core release: downloads its checksum manifest and torrent
//! descriptor from the release directory and rewrites the version pin. The
//! binary itself is installed afterwards by the normal acquisition pipeline.

use crate::error::{NodeError, Result};
use crate::node::config::{Settings, MANIFEST_FILE, PRODUCT};
use crate::node::downloader::fetch_bytes;
use crate::node::manifest::ChecksumManifest;
use crate::node::torrent::TorrentDescriptor;
use std::cmp::Ordering;
use std::fs;
use std::path::Path;

/// Result of pinning a release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinUpdate {
    /// Version now pinned
    pub version: String,
    /// Version pinned before, if any
    pub previous: Option<String>,
    /// Checksum entries in the new manifest
    pub checksums: usize,
}

impl PinUpdate {
    /// True when the new pin is older than the previous one
    pub fn is_downgrade(&self) -> bool {
        self.previous
            .as_deref()
            .is_some_and(|previous| is_newer_version(previous, &self.version))
    }
}

/// URL of a file in the release directory of `version`
pub fn release_file_url(base_url: &str, version: &str, file: &str) -> String {
    format!(
        "{}/bitcoin-core-{}/{}",
        base_url.trim_end_matches('/'),
        version,
        file
    )
}

/// Fetch the manifest and torrent for `version` and pin it
///
/// Both files are downloaded and checked before anything is written, so a
/// failed request leaves the previous pin intact.
pub async fn update_reference_files(settings: &Settings, version: &str) -> Result<PinUpdate> {
    let version = version.trim();
    if Version::parse(version).is_none() {
        return Err(NodeError::InvalidVersion {
            version: version.to_string(),
        });
    }
    let previous = settings.pinned_version().ok();

    let manifest_url = release_file_url(&settings.download_url, version, MANIFEST_FILE);
    log::info!("Fetching {}", manifest_url);
    let manifest = fetch_bytes(&manifest_url).await?;
    let checksums = ChecksumManifest::parse(&String::from_utf8_lossy(&manifest))
        .entries()
        .len();
    if checksums == 0 {
        log::warn!("{} lists no checksums", manifest_url);
    }

    let torrent_url = release_file_url(
        &settings.download_url,
        version,
        &format!("{}-{}.torrent", PRODUCT, version),
    );
    log::info!("Fetching {}", torrent_url);
    let torrent = fetch_bytes(&torrent_url).await?;
    TorrentDescriptor::parse(&torrent)?;

    fs::create_dir_all(&settings.resources_dir).map_err(|e| {
        NodeError::io(
            format!("Failed to create {}", settings.resources_dir.display()),
            e,
        )
    })?;
    write_file(&settings.manifest_path(), &manifest)?;
    write_file(&settings.torrent_path(), &torrent)?;
    write_file(&settings.version_path(), version.as_bytes())?;

    log::info!(
        "Pinned Bitcoin Core {} (was {})",
        version,
        previous.as_deref().unwrap_or("unpinned")
    );

    Ok(PinUpdate {
        version: version.to_string(),
        previous,
        checksums,
    })
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)
        .map_err(|e| NodeError::io(format!("Failed to write {}", path.display()), e))
}

/// Bitcoin Core release version: `0.21.0`, `22.0`, `0.21.0rc1`, `26.0rc2`
#[derive(Debug, Clone)]
struct Version {
    major: u32,
    minor: u32,
    patch: u32,
    /// Release candidate tag (e.g., "rc1"). None means final release.
    prerelease: Option<String>,
}

impl Version {
    fn parse(version: &str) -> Option<Self> {
        let version = version.trim_start_matches('v');
        let split = version
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(version.len());
        let (numbers, suffix) = version.split_at(split);

        let suffix = suffix.trim_start_matches('-');
        if !suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        let prerelease = (!suffix.is_empty()).then(|| suffix.to_string());

        let parts: Vec<&str> = numbers.split('.').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return None;
        }

        Some(Version {
            major: parts.first()?.parse().ok()?,
            minor: parts.get(1)?.parse().ok()?,
            patch: match parts.get(2) {
                Some(p) => p.parse().ok()?,
                None => 0,
            },
            prerelease,
        })
    }

    /// Compare pre-release tags. Returns ordering.
    /// None (final release) > Some (pre-release)
    fn compare_prerelease(a: &Option<String>, b: &Option<String>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => {
                let a_prefix = a.trim_end_matches(|c: char| c.is_ascii_digit());
                let b_prefix = b.trim_end_matches(|c: char| c.is_ascii_digit());

                // rc9 < rc10
                if a_prefix == b_prefix {
                    let a_num: u32 = a[a_prefix.len()..].parse().unwrap_or(0);
                    let b_num: u32 = b[b_prefix.len()..].parse().unwrap_or(0);
                    a_num.cmp(&b_num)
                } else {
                    a.cmp(b)
                }
            }
        }
    }
}

/// Returns true if `latest` is newer than `current`
fn is_newer_version(latest: &str, current: &str) -> bool {
    let (Some(latest), Some(current)) = (Version::parse(latest), Version::parse(current)) else {
        return false;
    };

    (latest.major, latest.minor, latest.patch)
        .cmp(&(current.major, current.minor, current.patch))
        .then_with(|| Version::compare_prerelease(&latest.prerelease, &current.prerelease))
        == Ordering::Greater
}
