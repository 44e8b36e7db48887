//! Release archive naming
//!
//! Maps (OS, CPU architecture, version) to the published archive name and
//! where to fetch it from. No network access happens here.

use super::config::{DAEMON_NAME, PRODUCT};
use crate::error::{NodeError, Result};

/// Operating systems with published archives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    MacOs,
    Linux,
}

/// CPU architectures we know archive suffixes for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Aarch64,
}

/// Resolved host platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: OsFamily,
    pub arch: Arch,
}

impl Platform {
    /// Platform of the running process
    pub fn current() -> Result<Self> {
        Self::from_names(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Resolve from Rust's `std::env::consts` OS/ARCH names
    pub fn from_names(os: &str, arch: &str) -> Result<Self> {
        let os_family = match os {
            "macos" => OsFamily::MacOs,
            "linux" => OsFamily::Linux,
            _ => {
                return Err(NodeError::UnsupportedPlatform { os: os.to_string() });
            }
        };

        let arch = match arch {
            "x86" => Arch::X86,
            "x86_64" => Arch::X86_64,
            "arm" => Arch::Arm,
            "aarch64" => Arch::Aarch64,
            _ => {
                return Err(NodeError::UnsupportedArchitecture {
                    os: os.to_string(),
                    arch: arch.to_string(),
                });
            }
        };

        let platform = Self { os: os_family, arch };
        // Validates the (os, arch) pair itself
        platform.archive_suffix()?;
        Ok(platform)
    }

    /// Archive suffix after `<product>-<version>-`
    pub fn archive_suffix(&self) -> Result<&'static str> {
        match (self.os, self.arch) {
            (OsFamily::MacOs, Arch::X86_64) => Ok("osx64.tar.gz"),
            (OsFamily::Linux, Arch::X86) => Ok("i686-pc-linux-gnu.tar.gz"),
            (OsFamily::Linux, Arch::X86_64) => Ok("x86_64-linux-gnu.tar.gz"),
            (OsFamily::Linux, Arch::Arm) => Ok("arm-linux-gnueabihf.tar.gz"),
            (OsFamily::Linux, Arch::Aarch64) => Ok("aarch64-linux-gnu.tar.gz"),
            (OsFamily::MacOs, arch) => Err(NodeError::UnsupportedArchitecture {
                os: "macos".to_string(),
                arch: format!("{:?}", arch).to_lowercase(),
            }),
        }
    }
}

/// Where a release archive can be fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Direct HTTPS download
    Url(String),
    /// Named entry inside a local torrent descriptor
    TorrentEntry(String),
}

/// Immutable description of the archive for one platform and version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub platform: Platform,
    pub version: String,
    pub filename: String,
}

impl ArtifactDescriptor {
    pub fn new(platform: Platform, version: impl Into<String>) -> Result<Self> {
        let version = version.into();
        let filename = format!("{}-{}-{}", PRODUCT, version, platform.archive_suffix()?);
        Ok(Self {
            platform,
            version,
            filename,
        })
    }

    /// Descriptor for the running platform
    pub fn for_current_platform(version: impl Into<String>) -> Result<Self> {
        Self::new(Platform::current()?, version)
    }

    /// Direct download URL under `base_url`
    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}/{}-core-{}/{}",
            base_url.trim_end_matches('/'),
            PRODUCT,
            self.version,
            self.filename
        )
    }

    /// Locator for the chosen transport
    pub fn locator(&self, base_url: Option<&str>) -> Locator {
        match base_url {
            Some(base) => Locator::Url(self.url(base)),
            None => Locator::TorrentEntry(self.filename.clone()),
        }
    }

    /// Path of the daemon inside the archive
    pub fn daemon_entry_path(&self) -> String {
        format!("{}-{}/bin/{}", PRODUCT, self.version, DAEMON_NAME)
    }
}
