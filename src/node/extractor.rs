//! Archive extraction for node binaries
//!
//! Pulls the single daemon entry out of a gzipped tarball as the bytes
//! arrive. Everything else in the archive is skipped.

use crate::error::{NodeError, Result};
use bytes::{Buf, Bytes};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use tokio::sync::mpsc;

/// Extract the entry at `entry_path` from a tar.gz stream into `dest`
///
/// Returns as soon as the entry is written; the rest of the stream is left
/// unread.
pub fn extract_entry<R: Read>(reader: R, entry_path: &str, dest: &Path) -> Result<()> {
    let gz = GzDecoder::new(reader);
    let mut archive = tar::Archive::new(gz);

    let entries = archive
        .entries()
        .map_err(|e| NodeError::Extraction(format!("Failed to read tar archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| NodeError::Extraction(format!("Failed to read tar entry: {}", e)))?;

        let matches = {
            let path = entry
                .path()
                .map_err(|e| NodeError::Extraction(format!("Failed to get entry path: {}", e)))?;
            normalize(&path.to_string_lossy()) == entry_path
        };
        if !matches {
            continue;
        }

        log::info!("Found {} in archive", entry_path);

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| NodeError::io("Failed to create extraction directory", e))?;
        }

        let mut outfile = File::create(dest)
            .map_err(|e| NodeError::io(format!("Failed to create {}", dest.display()), e))?;
        io::copy(&mut entry, &mut outfile)
            .map_err(|e| NodeError::Extraction(format!("Failed to extract file: {}", e)))?;

        make_executable(dest)?;
        return Ok(());
    }

    Err(NodeError::Extraction(format!("{} not found in archive", entry_path)))
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./")
}

/// Make executable on Unix
pub fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)
            .map_err(|e| NodeError::io("Failed to get file permissions", e))?
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)
            .map_err(|e| NodeError::io("Failed to set executable permission", e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Blocking `Read` over chunks sent from async code
///
/// Lets the synchronous tar reader run on a blocking thread while the
/// download loop keeps feeding it. End of stream is the sender hanging up.
pub struct ChunkReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChunkReader {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while !self.current.has_remaining() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(self.current.remaining());
        self.current.copy_to_slice(&mut buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Cursor;

    /// Build a tar.gz holding `(path, contents)` entries
    pub(crate) fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let gz = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(gz);
        for (path, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_extracts_only_the_daemon() {
        let archive = tarball(&[
            ("bitcoin-0.21.0/bin/bitcoin-cli", b"cli"),
            ("bitcoin-0.21.0/bin/bitcoind", b"daemon"),
            ("bitcoin-0.21.0/bin/test_bitcoin", b"tests"),
        ]);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out/bitcoind");

        extract_entry(Cursor::new(archive), "bitcoin-0.21.0/bin/bitcoind", &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"daemon");
        assert!(!dir.path().join("out/bitcoin-cli").exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&dest).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn test_missing_entry() {
        let archive = tarball(&[("bitcoin-0.20.0/bin/bitcoind", b"old")]);
        let dir = tempfile::tempdir().unwrap();
        let result = extract_entry(
            Cursor::new(archive),
            "bitcoin-0.21.0/bin/bitcoind",
            &dir.path().join("bitcoind"),
        );
        assert!(matches!(result, Err(NodeError::Extraction(_))));
    }

    #[test]
    fn test_not_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_entry(
            Cursor::new(b"plain bytes".to_vec()),
            "bitcoin-0.21.0/bin/bitcoind",
            &dir.path().join("bitcoind"),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_chunk_reader() {
        let (tx, rx) = mpsc::channel(4);
        let handle = std::thread::spawn(move || {
            let mut reader = ChunkReader::new(rx);
            let mut out = Vec::new();
            reader.read_to_end(&mut out).unwrap();
            out
        });

        tx.blocking_send(Bytes::from_static(b"hello ")).unwrap();
        tx.blocking_send(Bytes::new()).unwrap();
        tx.blocking_send(Bytes::from_static(b"world")).unwrap();
        drop(tx);

        assert_eq!(handle.join().unwrap(), b"hello world");
    }
}
