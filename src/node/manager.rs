//! Node process management
//!
//! Spawns bitcoind with generated flags and supervises it. The returned
//! [`NodeHandle`] owns the child: dropping the handle or calling
//! [`NodeHandle::kill`] terminates the daemon.

use super::config::{
    Settings, DEFAULT_READY_TIMEOUT, READY_POLL_INTERVAL, REGTEST_DEFAULT_RPC_PORT,
    STARTUP_GRACE, STREAM_DRAIN_DELAY,
};
use super::flags::{to_flags, LaunchOptions};
use super::output::{pump, Capture, DaemonOutput, OutputTap};
use super::readiness::{wait_for_exit, wait_until_ready, ExitOutcome, ExitWatch, ReadinessStats};
use super::rpc::{ReadinessProbe, RpcClient};
use crate::error::{NodeError, Result};
use base64::Engine;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long to wait for stderr to close after an early exit
const STDERR_SETTLE: Duration = Duration::from_millis(500);

/// Random bytes per generated RPC credential
const CREDENTIAL_BYTES: usize = 10;

/// Memoized readiness outcome, shared by every caller of [`NodeHandle::ready`]
pub type ReadyFuture = Shared<BoxFuture<'static, Result<()>>>;

/// Spawns supervised bitcoind processes
#[derive(Clone)]
pub struct Launcher {
    binary: PathBuf,
    mirror_output: bool,
    poll_interval: Duration,
    startup_grace: Duration,
    drain_delay: Duration,
    probe: Option<Arc<dyn ReadinessProbe>>,
}

impl Launcher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            mirror_output: false,
            poll_interval: READY_POLL_INTERVAL,
            startup_grace: STARTUP_GRACE,
            drain_delay: STREAM_DRAIN_DELAY,
            probe: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.binary_path).mirror_output(settings.mirror_output)
    }

    /// Launcher configured from `BITCOIND_BINARY` and `BITCOIND_LOG`
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_settings(&Settings::from_env()?))
    }

    /// Copy daemon stdout/stderr to our own
    pub fn mirror_output(mut self, mirror: bool) -> Self {
        self.mirror_output = mirror;
        self
    }

    /// Delay between readiness attempts
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replace the RPC readiness check
    pub fn with_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Spawn bitcoind with default options overlaid by `overrides`
    ///
    /// Must be called from within a Tokio runtime. Flag generation happens
    /// before anything is spawned, so an invalid key never starts a process.
    pub fn launch(&self, overrides: LaunchOptions) -> Result<NodeHandle> {
        let options = build_options(overrides);
        let args = to_flags(&options)?;
        let rpc = RpcClient::from_options(&options)?;

        log::debug!(
            "Spawning: {} {}",
            self.binary.display(),
            redact(&args).join(" ")
        );

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawned_at = Instant::now();
        let mut child = cmd.spawn().map_err(|e| {
            NodeError::io(format!("Failed to start {}", self.binary.display()), e)
        })?;

        let pid = child.id();
        log::info!("bitcoind started with PID {:?} ({})", pid, rpc.network().as_str());

        let stdout = Arc::new(OutputTap::new("stdout"));
        let stderr = Arc::new(OutputTap::new("stderr"));
        let captured = Capture::default();

        if let Some(out) = child.stdout.take() {
            let mirror = self.mirror_output.then(tokio::io::stdout);
            tokio::spawn(pump(out, stdout.clone(), mirror, None));
        }
        let stderr_pump = child.stderr.take().map(|err| {
            let mirror = self.mirror_output.then(tokio::io::stderr);
            tokio::spawn(pump(err, stderr.clone(), mirror, Some(captured.clone())))
        });

        let drain_delay = self.drain_delay;
        let taps = [stdout.clone(), stderr.clone()];
        tokio::spawn(async move {
            tokio::time::sleep(drain_delay).await;
            for tap in taps {
                tap.drain();
            }
        });

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(
            child,
            kill_rx,
            EarlyExit {
                spawned_at,
                grace: self.startup_grace,
                stderr_pump,
                captured,
            },
            exit_tx,
        ));

        let probe: Arc<dyn ReadinessProbe> = match &self.probe {
            Some(probe) => probe.clone(),
            None => Arc::new(rpc.clone()),
        };

        Ok(NodeHandle {
            pid,
            options,
            rpc,
            probe,
            poll_interval: self.poll_interval,
            exit: exit_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
            ready: Mutex::new(None),
            stats: Arc::new(ReadinessStats::default()),
            stdout,
            stderr,
        })
    }

    #[cfg(test)]
    fn timings(mut self, startup_grace: Duration, drain_delay: Duration) -> Self {
        self.startup_grace = startup_grace;
        self.drain_delay = drain_delay;
        self
    }
}

/// Launch bitcoind using environment settings
pub fn node(overrides: LaunchOptions) -> Result<NodeHandle> {
    Launcher::from_env()?.launch(overrides)
}

/// Defaults for a launch: server mode and fresh random RPC credentials
///
/// Regtest nodes without an explicit `rpcport` get a fixed one; other
/// networks keep the daemon's own default.
pub fn build_options(overrides: LaunchOptions) -> LaunchOptions {
    let mut options = LaunchOptions::new()
        .with("server", true)
        .with("rpcuser", random_credential())
        .with("rpcpassword", random_credential())
        .merge(overrides);

    if options.flag("regtest") && !options.contains("rpcport") {
        options.set("rpcport", REGTEST_DEFAULT_RPC_PORT);
    }
    options
}

fn random_credential() -> String {
    let mut bytes = [0u8; CREDENTIAL_BYTES];
    OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn redact(args: &[String]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            if arg.starts_with("-rpcpassword=") {
                "-rpcpassword=***".to_string()
            } else {
                arg.clone()
            }
        })
        .collect()
}

/// What the exit watcher needs to classify an exit inside the grace window
struct EarlyExit {
    spawned_at: Instant,
    grace: Duration,
    stderr_pump: Option<JoinHandle<()>>,
    captured: Capture,
}

/// Own the child until it exits, then publish the outcome exactly once
async fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    early: EarlyExit,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let mut killed = false;
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on kill() and when the handle is dropped
        _ = kill_rx => {
            killed = true;
            log::debug!("Killing bitcoind");
            if let Err(e) = child.start_kill() {
                log::warn!("Failed to kill bitcoind: {}", e);
            }
            child.wait().await
        }
    };

    let outcome = classify(status, killed, early).await;
    match &outcome {
        Ok(()) => log::info!("bitcoind exited cleanly"),
        Err(e) if killed => log::info!("bitcoind stopped: {}", e),
        Err(e) => log::warn!("{}", e),
    }
    let _ = exit_tx.send(Some(outcome));
}

async fn classify(
    status: std::io::Result<ExitStatus>,
    killed: bool,
    early: EarlyExit,
) -> ExitOutcome {
    let status = status.map_err(|e| NodeError::io("Failed to wait for bitcoind", e))?;
    if status.success() {
        return Ok(());
    }

    if !killed && early.spawned_at.elapsed() < early.grace {
        if let Some(stderr_pump) = early.stderr_pump {
            // Anything the daemon inherited stderr to can hold it open
            let _ = tokio::time::timeout(STDERR_SETTLE, stderr_pump).await;
        }
        return Err(NodeError::ProcessStartupFailure {
            stderr: early.captured.contents(),
        });
    }

    Err(NodeError::UnexpectedExit {
        code: status.code(),
    })
}

/// A running, supervised bitcoind
pub struct NodeHandle {
    pid: Option<u32>,
    options: LaunchOptions,
    rpc: RpcClient,
    probe: Arc<dyn ReadinessProbe>,
    poll_interval: Duration,
    exit: ExitWatch,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    ready: Mutex<Option<ReadyFuture>>,
    stats: Arc<ReadinessStats>,
    stdout: Arc<OutputTap>,
    stderr: Arc<OutputTap>,
}

impl NodeHandle {
    /// OS process id, if the process had not already been reaped at spawn
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// RPC client using the credentials the daemon was launched with
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// The final options the daemon was launched with, defaults included
    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    /// Wait until the daemon answers RPC
    ///
    /// The first call starts polling with `timeout` (default 30 s) measured
    /// from that call. Every later call returns the same future, whatever
    /// timeout it passes. Process exit fails the wait immediately.
    pub fn ready(&self, timeout: Option<Duration>) -> ReadyFuture {
        let mut slot = self.ready.lock().unwrap();
        if let Some(ready) = slot.as_ref() {
            return ready.clone();
        }

        let task = tokio::spawn(wait_until_ready(
            self.probe.clone(),
            self.exit.clone(),
            timeout.unwrap_or(DEFAULT_READY_TIMEOUT),
            self.poll_interval,
            self.stats.clone(),
        ));
        let ready = async move {
            task.await
                .unwrap_or_else(|e| Err(NodeError::Rpc(format!("readiness task failed: {}", e))))
        }
        .boxed()
        .shared();

        *slot = Some(ready.clone());
        ready
    }

    /// Attempt counters of the readiness wait
    pub fn readiness_stats(&self) -> &ReadinessStats {
        &self.stats
    }

    /// Exit outcome if the daemon has already exited
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    /// Wait for the daemon to exit
    ///
    /// `Ok(())` for a zero exit status. A non-zero exit inside the startup
    /// grace window yields [`NodeError::ProcessStartupFailure`] with the
    /// daemon's stderr; later ones yield [`NodeError::UnexpectedExit`].
    pub async fn exited(&self) -> ExitOutcome {
        let mut exit = self.exit.clone();
        wait_for_exit(&mut exit).await
    }

    /// Claim the daemon's stdout; `None` if already claimed or drained
    pub fn take_stdout(&self) -> Option<DaemonOutput> {
        self.stdout.attach()
    }

    /// Claim the daemon's stderr; `None` if already claimed or drained
    pub fn take_stderr(&self) -> Option<DaemonOutput> {
        self.stderr.attach()
    }

    /// Kill the daemon. Returns immediately; await [`exited`](Self::exited)
    /// to observe the exit.
    pub fn kill(&self) {
        if let Some(kill_tx) = self.kill_tx.lock().unwrap().take() {
            let _ = kill_tx.send(());
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::node::readiness::tests::FlakyProbe;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Stand-in daemon: a shell script that ignores its flags
    fn fake_daemon(body: &str) -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bitcoind");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_options() {
        let options = build_options(LaunchOptions::new());
        let keys: Vec<_> = options.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["server", "rpcuser", "rpcpassword"]);
        assert!(options.flag("server"));

        let user = options.get("rpcuser").unwrap().to_string();
        let pass = options.get("rpcpassword").unwrap().to_string();
        // 10 bytes of base64
        assert_eq!(user.len(), 16);
        assert_eq!(pass.len(), 16);
        assert_ne!(user, pass);
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let options = build_options(LaunchOptions::new().with("rpcuser", "alice").with("txindex", true));
        assert_eq!(options.get("rpcuser").unwrap().to_string(), "alice");
        assert_eq!(
            to_flags(&options).unwrap()[1],
            "-rpcuser=alice",
            "override keeps the default's position"
        );
        assert!(options.flag("txindex"));
    }

    #[test]
    fn test_regtest_port_default() {
        let options = build_options(LaunchOptions::new().with("regtest", true));
        assert_eq!(options.get("rpcport").unwrap().as_u16(), Some(REGTEST_DEFAULT_RPC_PORT));

        let options = build_options(LaunchOptions::new().with("regtest", true).with("rpcport", 20000u16));
        assert_eq!(options.get("rpcport").unwrap().as_u16(), Some(20000));

        let options = build_options(LaunchOptions::new().with("testnet", true));
        assert!(!options.contains("rpcport"));
    }

    #[test]
    fn test_redact_password() {
        let args = vec!["-server=1".to_string(), "-rpcpassword=hunter2".to_string()];
        assert_eq!(redact(&args), ["-server=1", "-rpcpassword=***"]);
    }

    #[tokio::test]
    async fn test_uppercase_key_fails_before_spawn() {
        let launcher = Launcher::new("/nonexistent/bitcoind");
        let result = launcher.launch(LaunchOptions::new().with("rpcPort", 8332));
        assert!(matches!(result, Err(NodeError::InvalidOptionKey { ref key }) if key == "rpcPort"));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let launcher = Launcher::new("/nonexistent/bitcoind");
        assert!(matches!(
            launcher.launch(LaunchOptions::new()),
            Err(NodeError::Io { .. })
        ));
    }

    #[tokio::test]
    async fn test_early_exit_surfaces_stderr() {
        let (_dir, bin) = fake_daemon("echo 'Error: Invalid combination of -regtest and -testnet.' >&2\nexit 1");
        let node = Launcher::new(&bin).launch(LaunchOptions::new()).unwrap();

        match node.exited().await {
            Err(NodeError::ProcessStartupFailure { stderr }) => {
                assert_eq!(stderr, "Error: Invalid combination of -regtest and -testnet.\n");
            }
            other => panic!("expected startup failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_exit_reports_code() {
        let (_dir, bin) = fake_daemon("echo 'shutting down' >&2\nsleep 2\nexit 3");
        let node = Launcher::new(&bin).launch(LaunchOptions::new()).unwrap();

        let err = node.exited().await.unwrap_err();
        assert_eq!(err.to_string(), "bitcoind exited with code 3");
        assert!(!node.is_running());
    }

    #[tokio::test]
    async fn test_clean_exit() {
        let (_dir, bin) = fake_daemon("exit 0");
        let node = Launcher::new(&bin).launch(LaunchOptions::new()).unwrap();
        assert!(node.exited().await.is_ok());
        assert!(matches!(node.exit_outcome(), Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_flags_reach_daemon() {
        let (_dir, bin) = fake_daemon("printf '%s ' \"$@\"");
        let node = Launcher::new(&bin)
            .launch(LaunchOptions::new().with("regtest", true))
            .unwrap();

        let stdout = node.take_stdout().unwrap().read_to_string().await;
        assert!(stdout.starts_with("-server=1 -rpcuser="));
        assert!(stdout.contains(" -regtest=1 -rpcport=18332"));
        assert!(node.take_stdout().is_none());
    }

    #[tokio::test]
    async fn test_unclaimed_output_is_drained() {
        let (_dir, bin) = fake_daemon("echo hello\nexec sleep 30");
        let node = Launcher::new(&bin)
            .timings(STARTUP_GRACE, Duration::from_millis(50))
            .launch(LaunchOptions::new())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(node.take_stdout().is_none());
        assert!(node.take_stderr().is_none());
        assert!(node.is_running());
    }

    #[tokio::test]
    async fn test_kill_stops_daemon() {
        let (_dir, bin) = fake_daemon("exec sleep 30");
        let node = Launcher::new(&bin).launch(LaunchOptions::new()).unwrap();

        node.kill();
        let err = node.exited().await.unwrap_err();
        assert!(matches!(err, NodeError::UnexpectedExit { code: None }));
        // Second kill is a no-op
        node.kill();
    }

    #[tokio::test]
    async fn test_ready_after_failures() {
        let (_dir, bin) = fake_daemon("exec sleep 30");
        let probe = Arc::new(FlakyProbe::new(2));
        let node = Launcher::new(&bin)
            .poll_interval(Duration::from_millis(20))
            .with_probe(probe.clone())
            .launch(LaunchOptions::new())
            .unwrap();

        node.ready(None).await.unwrap();
        assert_eq!(node.readiness_stats().attempts(), 3);
        assert_eq!(node.readiness_stats().failures(), 2);
    }

    #[tokio::test]
    async fn test_ready_is_memoized() {
        let (_dir, bin) = fake_daemon("exec sleep 30");
        let probe = Arc::new(FlakyProbe::never());
        let node = Launcher::new(&bin)
            .poll_interval(Duration::from_millis(50))
            .with_probe(probe.clone())
            .launch(LaunchOptions::new())
            .unwrap();

        let first = node.ready(Some(Duration::from_millis(300)));
        let second = node.ready(Some(Duration::from_secs(60)));
        let (a, b) = tokio::join!(first, second);

        assert!(matches!(a, Err(NodeError::ReadinessTimeout { .. })));
        assert!(matches!(b, Err(NodeError::ReadinessTimeout { .. })));
        // One loop: 300ms / 50ms, not twice that
        assert!(probe.calls() <= 8, "got {} attempts", probe.calls());
        assert_eq!(node.readiness_stats().attempts(), probe.calls());

        // Resolved future is reused as well
        assert!(node.ready(None).await.is_err());
        assert_eq!(node.readiness_stats().attempts(), probe.calls());
    }

    #[tokio::test]
    async fn test_exit_fails_readiness() {
        let (_dir, bin) = fake_daemon("echo 'Error: Cannot obtain a lock on data directory' >&2\nexit 1");
        let node = Launcher::new(&bin)
            .with_probe(Arc::new(FlakyProbe::never()))
            .launch(LaunchOptions::new())
            .unwrap();

        let start = Instant::now();
        let err = node.ready(None).await.unwrap_err();
        assert!(matches!(err, NodeError::ProcessStartupFailure { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
