//! Core process lifecycle for one test task.
//!
//! Each task writes a rendered config to a per-task path, spawns the
//! proxy core pointed at it, and waits for the leased inbound port to
//! accept TCP before probing. The handle is owned exclusively by its
//! task; `stop` is safe on every exit path, and dropping an un-stopped
//! handle still kills the child and releases its resources.

pub mod output;
pub mod render;
pub mod terminate;

pub use output::OutputTail;
pub use render::render_core_config;

use relaytest_common::{Result, TesterError};
use relaytest_metrics::Metrics;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long the inbound port gets to accept its first connection.
const READINESS_TIMEOUT: Duration = Duration::from_secs(2);
const READINESS_POLL: Duration = Duration::from_millis(50);
/// Grace between SIGTERM and SIGKILL when stopping the child.
const STOP_GRACE: Duration = Duration::from_millis(500);

static CONFIG_SEQ: AtomicU64 = AtomicU64::new(0);

/// Everything needed to launch the core for one candidate.
pub struct CoreLaunchSpec {
    pub core_binary: PathBuf,
    pub config_dir: PathBuf,
    pub tag: String,
    pub port: u16,
    pub config: Value,
}

/// A running (or already stopped) core child process.
pub struct CoreProcess {
    tag: String,
    port: u16,
    pid: u32,
    child: Child,
    config_path: PathBuf,
    stdout_tail: OutputTail,
    stderr_tail: OutputTail,
    drain_tasks: Vec<JoinHandle<()>>,
    metrics: Arc<Metrics>,
    stopped: bool,
}

impl CoreProcess {
    /// Write the config file, spawn the core, and wait for readiness.
    ///
    /// Failure classification:
    /// - the binary cannot be spawned, or exits before the inbound is up
    ///   → `LaunchFailed`;
    /// - the process stays alive but the inbound never accepts within the
    ///   readiness deadline → `PortConflict`;
    /// - the token fires while waiting → `Cancelled`.
    pub async fn launch(
        token: &CancellationToken,
        spec: CoreLaunchSpec,
        metrics: Arc<Metrics>,
    ) -> Result<CoreProcess> {
        let seq = CONFIG_SEQ.fetch_add(1, Ordering::Relaxed);
        let config_path = spec
            .config_dir
            .join(format!("relaytest-{}-{}.json", spec.port, seq));

        let body = serde_json::to_vec_pretty(&spec.config)?;
        if let Err(e) = tokio::fs::write(&config_path, body).await {
            return Err(TesterError::launch_failed(
                &spec.tag,
                format!("cannot write core config {}: {}", config_path.display(), e),
            ));
        }

        let mut command = Command::new(&spec.core_binary);
        command
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_file(&config_path).await;
                return Err(TesterError::launch_failed(
                    &spec.tag,
                    format!("cannot exec {}: {}", spec.core_binary.display(), e),
                ));
            }
        };

        let pid = child.id().unwrap_or(0);
        metrics.process_started();
        debug!(tag = %spec.tag, pid, port = spec.port, "core process spawned");

        let stdout_tail = OutputTail::new();
        let stderr_tail = OutputTail::new();
        let mut drain_tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            drain_tasks.push(output::drain_stream(stdout, stdout_tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            drain_tasks.push(output::drain_stream(stderr, stderr_tail.clone()));
        }

        let mut process = CoreProcess {
            tag: spec.tag,
            port: spec.port,
            pid,
            child,
            config_path,
            stdout_tail,
            stderr_tail,
            drain_tasks,
            metrics,
            stopped: false,
        };

        if let Err(e) = process.wait_ready(token).await {
            process.stop().await;
            return Err(e);
        }

        Ok(process)
    }

    /// Local inbound endpoint of the running core.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Captured output tail for failure diagnostics, stderr preferred.
    pub fn output_tail(&self) -> String {
        if !self.stderr_tail.is_empty() {
            self.stderr_tail.contents()
        } else {
            self.stdout_tail.contents()
        }
    }

    async fn wait_ready(&mut self, token: &CancellationToken) -> Result<()> {
        let deadline = Instant::now() + READINESS_TIMEOUT;

        loop {
            if let Ok(Some(status)) = self.child.try_wait() {
                // Pipes are at EOF now; finish draining so the tail is
                // complete before it lands in the failure message.
                for task in self.drain_tasks.drain(..) {
                    let _ = task.await;
                }
                return Err(TesterError::launch_failed(
                    &self.tag,
                    format!(
                        "core exited during startup ({}){}",
                        status,
                        self.tail_suffix()
                    ),
                ));
            }

            if TcpStream::connect(("127.0.0.1", self.port)).await.is_ok() {
                debug!(tag = %self.tag, port = self.port, "core inbound ready");
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(TesterError::port_conflict(
                    &self.tag,
                    self.port,
                    format!(
                        "inbound not accepting within {:?}{}",
                        READINESS_TIMEOUT,
                        self.tail_suffix()
                    ),
                ));
            }

            tokio::select! {
                _ = token.cancelled() => return Err(TesterError::Cancelled),
                _ = sleep(READINESS_POLL) => {}
            }
        }
    }

    /// Terminate the child and clean up. Safe to call more than once.
    pub async fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        #[cfg(unix)]
        if self.pid != 0 {
            if let Err(e) = terminate::terminate_gracefully(self.pid) {
                debug!(tag = %self.tag, error = %e, "graceful signal failed");
            }
        }

        match timeout(STOP_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(tag = %self.tag, pid = self.pid, %status, "core stopped");
            }
            Ok(Err(e)) => {
                warn!(tag = %self.tag, pid = self.pid, error = %e, "wait on core failed");
            }
            Err(_) => {
                warn!(tag = %self.tag, pid = self.pid, "graceful stop timed out, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(tag = %self.tag, pid = self.pid, error = %e, "kill failed");
                }
            }
        }

        for task in self.drain_tasks.drain(..) {
            let _ = task.await;
        }

        if let Err(e) = tokio::fs::remove_file(&self.config_path).await {
            debug!(path = %self.config_path.display(), error = %e, "config file removal failed");
        }

        self.metrics.process_stopped();
    }

    fn tail_suffix(&self) -> String {
        let tail = self.output_tail();
        if tail.is_empty() {
            String::new()
        } else {
            format!("; output: {}", tail)
        }
    }
}

impl Drop for CoreProcess {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        // The owning task was aborted before it could stop us. The child
        // dies with the handle (kill_on_drop), but the bookkeeping still
        // has to balance here.
        let _ = self.child.start_kill();
        for task in self.drain_tasks.drain(..) {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.config_path);
        self.metrics.process_stopped();
        self.stopped = true;
    }
}
