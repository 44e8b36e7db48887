//! SHA256 accumulation
//!
//! The download stream is hashed chunk by chunk while it is being unpacked,
//! so the archive is never read twice.

use sha2::{Digest, Sha256};

/// Running SHA-256 over a byte stream
#[derive(Clone, Default)]
pub struct StreamHasher {
    inner: Sha256,
    bytes: u64,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Lowercase hex digest
    pub fn finalize_hex(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Compute SHA256 hash of bytes (for small data)
pub fn compute_bytes_hash(data: &[u8]) -> String {
    let mut hasher = StreamHasher::new();
    hasher.update(data);
    hasher.finalize_hex()
}

/// Constant-shape comparison of two hex digests, case-insensitive
pub fn digests_match(actual: &str, expected: &str) -> bool {
    actual.len() == expected.len()
        && actual
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| {
                acc | (a.to_ascii_lowercase() ^ b.to_ascii_lowercase())
            })
            == 0
}
