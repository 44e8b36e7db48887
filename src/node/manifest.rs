//! Checksum manifest parsing
//!
//! The manifest is a clearsigned `SHA256SUMS.asc`: a three-line PGP header,
//! then `<sha256-hex> <filename>` lines, then the signature block.

use crate::error::{NodeError, Result};
use std::path::Path;

/// Lines of PGP preamble before the first digest line
const HEADER_LINES: usize = 3;

const DIGEST_HEX_LEN: usize = 64;

/// One `(digest, filename)` pair from the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    /// Lowercase hex SHA-256
    pub digest: String,
    pub filename: String,
}

/// Ordered list of pinned digests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumManifest {
    entries: Vec<ChecksumEntry>,
}

impl ChecksumManifest {
    /// Parse manifest text; malformed lines are skipped
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .skip(HEADER_LINES)
            .filter_map(parse_line)
            .collect();
        Self { entries }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| NodeError::io(format!("Failed to read {}", path.display()), e))?;
        Ok(Self::parse(&contents))
    }

    pub fn entries(&self) -> &[ChecksumEntry] {
        &self.entries
    }

    /// Expected digest for an archive, first match wins
    ///
    /// Manifest names may carry a directory prefix, and older manifests list
    /// shortened names, so either side may be a suffix of the other.
    pub fn expected_for(&self, archive_filename: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| names_match(&entry.filename, archive_filename))
            .map(|entry| entry.digest.as_str())
    }
}

fn parse_line(line: &str) -> Option<ChecksumEntry> {
    let mut parts = line.split_whitespace();
    let digest = parts.next()?;
    let filename = parts.next()?.trim_start_matches('*');

    if digest.len() != DIGEST_HEX_LEN || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    if filename.is_empty() {
        return None;
    }

    Some(ChecksumEntry {
        digest: digest.to_lowercase(),
        filename: filename.to_string(),
    })
}

fn names_match(listed: &str, archive: &str) -> bool {
    listed == archive
        || archive.ends_with(listed)
        || listed.ends_with(&format!("/{}", archive))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_HASH: &str = "da7766775e3f9c98d7a9145429f2be8297c2672fe5b118fd3dc2411fb48e0032";
    const OSX_HASH: &str = "1ea5cedb64318e9868a66d3ab65de14516f9ada53143e460d50af428b5aec3c7";

    fn sample() -> String {
        format!(
            "-----BEGIN PGP SIGNED MESSAGE-----\n\
             Hash: SHA256\n\
             \n\
             {osx}  bitcoin-0.21.0-osx64.tar.gz\n\
             deadbeef  bitcoin-0.21.0-short.tar.gz\n\
             not a digest line at all\n\
             {linux}  bitcoin-0.21.0-x86_64-linux-gnu.tar.gz\n\
             -----BEGIN PGP SIGNATURE-----\n",
            osx = OSX_HASH,
            linux = LINUX_HASH,
        )
    }

    #[test]
    fn test_parse_skips_malformed_lines() {
        let manifest = ChecksumManifest::parse(&sample());
        assert_eq!(manifest.entries().len(), 2);
        assert_eq!(manifest.entries()[0].filename, "bitcoin-0.21.0-osx64.tar.gz");
    }

    #[test]
    fn test_header_is_skipped_even_if_it_looks_like_a_digest() {
        let text = format!("{h}  a.tar.gz\n\n\n{h}  b.tar.gz\n", h = LINUX_HASH);
        let manifest = ChecksumManifest::parse(&text);
        assert_eq!(manifest.entries().len(), 1);
        assert_eq!(manifest.entries()[0].filename, "b.tar.gz");
    }

    #[test]
    fn test_expected_for() {
        let manifest = ChecksumManifest::parse(&sample());
        assert_eq!(
            manifest.expected_for("bitcoin-0.21.0-x86_64-linux-gnu.tar.gz"),
            Some(LINUX_HASH)
        );
        assert_eq!(manifest.expected_for("bitcoin-0.21.0-win64.zip"), None);
    }

    #[test]
    fn test_expected_for_prefixed_names() {
        let text = format!(
            "h\nh\nh\n{}  bitcoin-0.21.0/bitcoin-0.21.0-x86_64-linux-gnu.tar.gz\n",
            LINUX_HASH.to_uppercase()
        );
        let manifest = ChecksumManifest::parse(&text);
        assert_eq!(
            manifest.expected_for("bitcoin-0.21.0-x86_64-linux-gnu.tar.gz"),
            Some(LINUX_HASH)
        );
    }
}
