//! Readiness polling
//!
//! Polls a [`ReadinessProbe`] at a fixed interval until it succeeds, the
//! deadline passes or the daemon exits. Failed attempts are expected while
//! bitcoind starts up; they are counted and logged at debug, never returned.

use super::rpc::ReadinessProbe;
use crate::error::{NodeError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How the daemon process ended
pub type ExitOutcome = Result<()>;

/// Receives the daemon's exit outcome once it is known
pub type ExitWatch = watch::Receiver<Option<ExitOutcome>>;

/// Attempt counters for one readiness wait
#[derive(Debug, Default)]
pub struct ReadinessStats {
    attempts: AtomicU32,
    failures: AtomicU32,
}

impl ReadinessStats {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

/// Wait until `probe` succeeds, failing on timeout or daemon exit
///
/// The timeout covers the whole wait. When it fires the in-flight attempt is
/// dropped and no further attempts are made.
pub async fn wait_until_ready(
    probe: Arc<dyn ReadinessProbe>,
    exit: ExitWatch,
    timeout: Duration,
    interval: Duration,
    stats: Arc<ReadinessStats>,
) -> Result<()> {
    let mut exit_rx = exit.clone();
    let polling = poll(probe, exit, interval, stats);

    let race = async {
        tokio::select! {
            biased;
            outcome = wait_for_exit(&mut exit_rx) => Err(exited_before_ready(outcome)),
            result = polling => result,
        }
    };

    match tokio::time::timeout(timeout, race).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("bitcoind RPC not ready after {:?}", timeout);
            Err(NodeError::ReadinessTimeout { timeout })
        }
    }
}

async fn poll(
    probe: Arc<dyn ReadinessProbe>,
    exit: ExitWatch,
    interval: Duration,
    stats: Arc<ReadinessStats>,
) -> Result<()> {
    loop {
        let attempt = stats.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        match probe.probe().await {
            Ok(()) => {
                // A response racing the exit must not count as ready
                let exited = exit.borrow().clone();
                if let Some(outcome) = exited {
                    return Err(exited_before_ready(outcome));
                }
                log::info!("bitcoind RPC ready after {} attempt(s)", attempt);
                return Ok(());
            }
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::SeqCst);
                log::debug!("Readiness attempt {} failed: {}", attempt, e);
            }
        }

        tokio::time::sleep(interval).await;
    }
}

/// Resolve with the exit outcome once it is published
pub async fn wait_for_exit(exit: &mut ExitWatch) -> ExitOutcome {
    match exit.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
        // Watcher went away without publishing; the child is gone with it
        Err(_) => Err(NodeError::UnexpectedExit { code: None }),
    }
}

fn exited_before_ready(outcome: ExitOutcome) -> NodeError {
    match outcome {
        Err(e) => e,
        Ok(()) => NodeError::UnexpectedExit { code: Some(0) },
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::time::Instant;

    /// Fails the first `failures` calls, then succeeds
    pub(crate) struct FlakyProbe {
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyProbe {
        pub(crate) fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }

        pub(crate) fn never() -> Self {
            Self::new(u32::MAX)
        }

        pub(crate) fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReadinessProbe for FlakyProbe {
        async fn probe(&self) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(NodeError::Rpc("connection refused".to_string()))
            } else {
                Ok(())
            }
        }
    }

    const INTERVAL: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_failures() {
        let probe = Arc::new(FlakyProbe::new(3));
        let stats = Arc::new(ReadinessStats::default());
        let (_tx, rx) = watch::channel(None);

        let start = Instant::now();
        wait_until_ready(probe.clone(), rx, Duration::from_secs(30), INTERVAL, stats.clone())
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= INTERVAL * 3);
        assert!(elapsed < INTERVAL * 3 + Duration::from_millis(100));
        assert_eq!(probe.calls(), 4);
        assert_eq!(stats.attempts(), 4);
        assert_eq!(stats.failures(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_at_deadline() {
        let probe = Arc::new(FlakyProbe::never());
        let stats = Arc::new(ReadinessStats::default());
        let (_tx, rx) = watch::channel(None);
        let timeout = Duration::from_secs(5);

        let start = Instant::now();
        let err = wait_until_ready(probe.clone(), rx, timeout, INTERVAL, stats)
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, NodeError::ReadinessTimeout { .. }));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + INTERVAL);

        // No attempts after the deadline
        let calls = probe.calls();
        tokio::time::sleep(INTERVAL * 5).await;
        assert_eq!(probe.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_cancels_wait() {
        let probe = Arc::new(FlakyProbe::never());
        let stats = Arc::new(ReadinessStats::default());
        let (tx, rx) = watch::channel(None);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            let _ = tx.send(Some(Err(NodeError::UnexpectedExit { code: Some(1) })));
        });

        let start = Instant::now();
        let err = wait_until_ready(probe, rx, Duration::from_secs(30), INTERVAL, stats)
            .await
            .unwrap_err();

        assert!(matches!(err, NodeError::UnexpectedExit { code: Some(1) }));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_exit_is_not_ready() {
        let probe = Arc::new(FlakyProbe::new(0));
        let stats = Arc::new(ReadinessStats::default());
        let (_tx, rx) = watch::channel(Some(Ok(())));

        let err = wait_until_ready(probe, rx, Duration::from_secs(30), INTERVAL, stats)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::UnexpectedExit { code: Some(0) }));
    }

    #[tokio::test]
    async fn test_wait_for_exit_when_watcher_vanishes() {
        let (tx, mut rx) = watch::channel::<Option<ExitOutcome>>(None);
        drop(tx);
        assert!(wait_for_exit(&mut rx).await.is_err());
    }
}
