//! Version-keyed binary cache
//!
//! A verified binary is copied to `<cache_root>/bitcoind_<version>` after
//! install, so later installs of the same version need no network at all.

use crate::error::{NodeError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// Copy a cached binary to `binary_path` if one exists
///
/// Returns `Ok(false)` only when the cache entry does not exist; any other
/// filesystem error is returned.
pub fn restore(cached: &Path, binary_path: &Path) -> Result<bool> {
    match fs::metadata(cached) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => {
            return Err(NodeError::io(
                format!("Failed to access cache entry {}", cached.display()),
                e,
            ));
        }
    }

    if let Some(parent) = binary_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| NodeError::io("Failed to create binary directory", e))?;
    }
    fs::copy(cached, binary_path)
        .map_err(|e| NodeError::io(format!("Failed to copy {}", cached.display()), e))?;

    log::info!("Restored {} from cache {}", binary_path.display(), cached.display());
    Ok(true)
}

/// Store a verified binary in the cache
pub fn store(binary_path: &Path, cached: &Path) -> Result<()> {
    if let Some(parent) = cached.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| NodeError::io(format!("Failed to create cache dir {}", parent.display()), e))?;
    }
    fs::copy(binary_path, cached)
        .map_err(|e| NodeError::io(format!("Failed to write cache entry {}", cached.display()), e))?;

    log::info!("Cached binary at {}", cached.display());
    Ok(())
}
