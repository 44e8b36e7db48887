//! Download progress accounting
//!
//! Tracks the stage and byte counter of one acquisition attempt and logs a
//! throttled progress line while bytes arrive.

use std::fmt;
use std::time::{Duration, Instant};

/// Minimum spacing between progress log lines
const LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Stages of the download process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadStage {
    #[default]
    Idle,
    /// Checking the version-keyed cache
    CheckingCache,
    /// Streaming, hashing and extracting the archive
    Downloading,
    /// Comparing the digest against the manifest
    Verifying,
    /// Moving the verified binary into place
    Installing,
    /// Download complete
    Complete,
    /// Download failed
    Failed,
}

impl fmt::Display for DownloadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloadStage::Idle => "idle",
            DownloadStage::CheckingCache => "checking cache",
            DownloadStage::Downloading => "downloading",
            DownloadStage::Verifying => "verifying",
            DownloadStage::Installing => "installing",
            DownloadStage::Complete => "complete",
            DownloadStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Download progress information
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes downloaded so far
    pub downloaded: u64,
    /// Total bytes to download, if the transport knows it
    pub total: Option<u64>,
    /// Current stage of the download process
    pub stage: DownloadStage,
    /// File being downloaded
    pub file_name: String,
    start_time: Instant,
    last_log: Instant,
}

impl DownloadProgress {
    pub fn new(file_name: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            downloaded: 0,
            total: None,
            stage: DownloadStage::Idle,
            file_name: file_name.into(),
            start_time: now,
            last_log: now,
        }
    }

    pub fn set_stage(&mut self, stage: DownloadStage) {
        if self.stage != stage {
            log::info!("{}: {}", self.file_name, stage);
            self.stage = stage;
        }
    }

    /// Count a received chunk, logging at most once per interval
    pub fn record(&mut self, len: usize) {
        self.downloaded += len as u64;

        if self.last_log.elapsed() >= LOG_INTERVAL {
            log::info!("{}", self.summary());
            self.last_log = Instant::now();
        }
    }

    /// Average speed in bytes per second
    pub fn speed(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.downloaded as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Completion ratio, when the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.downloaded as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }

    pub fn summary(&self) -> String {
        let mbps = self.speed() * 8.0 / 1e6;
        match self.fraction() {
            Some(fraction) => format!(
                "{}: {:.0}% ({} bytes, {:.1} Mbps)",
                self.file_name,
                fraction * 100.0,
                self.downloaded,
                mbps
            ),
            None => format!("{}: {} bytes ({:.1} Mbps)", self.file_name, self.downloaded, mbps),
        }
    }
}
