//! Signal-driven shutdown coordination.
//!
//! First signal: cancel the batch token and let in-flight tasks drain.
//! Second signal, or the graceful window running out: cancel the abort
//! token, which cuts the drain short and force-terminates surviving
//! core processes through their owning tasks.
//!
//! States: `Running → Draining → Stopped`, with `Aborting` interposed
//! when the drain is cut short.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Running,
    Draining,
    Aborting,
    Stopped,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Running => write!(f, "running"),
            SupervisorState::Draining => write!(f, "draining"),
            SupervisorState::Aborting => write!(f, "aborting"),
            SupervisorState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Coordinates graceful drain and forced termination.
pub struct ShutdownSupervisor {
    batch_token: CancellationToken,
    abort_token: CancellationToken,
    state: Mutex<SupervisorState>,
    graceful_timeout: Duration,
}

impl ShutdownSupervisor {
    pub fn new(graceful_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            batch_token: CancellationToken::new(),
            abort_token: CancellationToken::new(),
            state: Mutex::new(SupervisorState::Running),
            graceful_timeout,
        })
    }

    /// Token every batch wait is bound to; cancelled on the first signal.
    pub fn batch_token(&self) -> CancellationToken {
        self.batch_token.clone()
    }

    /// Token that cuts the drain window short; cancelled on the second
    /// signal or when the drain deadline passes.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort_token.clone()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    /// Whether shutdown was ever requested; drives the 130 exit code.
    pub fn interrupted(&self) -> bool {
        self.batch_token.is_cancelled()
    }

    /// First-signal transition: start draining.
    pub fn begin_drain(&self) {
        {
            let mut state = self.state.lock();
            if *state != SupervisorState::Running {
                return;
            }
            *state = SupervisorState::Draining;
        }
        info!(
            grace = ?self.graceful_timeout,
            "graceful shutdown: draining in-flight tests"
        );
        self.batch_token.cancel();
    }

    /// Second-signal / deadline transition: force-terminate.
    pub fn abort(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                SupervisorState::Running | SupervisorState::Draining => {
                    *state = SupervisorState::Aborting;
                }
                _ => return,
            }
        }
        warn!("forcing termination of surviving core processes");
        self.batch_token.cancel();
        self.abort_token.cancel();
    }

    /// Terminal transition once the driver has returned.
    pub fn finish(&self) {
        *self.state.lock() = SupervisorState::Stopped;
    }

    /// Install the OS signal listener. The returned task lives until the
    /// process exits; it is not joined on the normal path.
    pub fn install(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            wait_for_signal().await;
            supervisor.begin_drain();

            tokio::select! {
                _ = wait_for_signal() => {
                    info!("second signal received");
                    supervisor.abort();
                }
                _ = tokio::time::sleep(supervisor.graceful_timeout) => {
                    if supervisor.state() == SupervisorState::Draining {
                        warn!("graceful window elapsed");
                        supervisor.abort();
                    }
                }
                _ = supervisor.abort_token.cancelled() => {}
            }
        })
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "cannot install SIGINT handler");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("received Ctrl+C");
    } else {
        std::future::pending::<()>().await;
    }
}
