//! Periodic resident-memory sampling.

use crate::Metrics;
use std::sync::Arc;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const SAMPLE_PERIOD: Duration = Duration::from_secs(5);

/// Spawn the background task that refreshes `memory_usage_mb` every 5 s.
///
/// When `limit_mb` is set, crossing it is logged; enforcement itself is
/// the admission controller's job.
pub fn spawn_memory_sampler(
    metrics: Arc<Metrics>,
    limit_mb: Option<u64>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());
        let mut ticker = interval(SAMPLE_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let mb = resident_memory_mb(&mut system, pid);
                    metrics.set_memory_usage_mb(mb);

                    if let Some(limit) = limit_mb {
                        if limit > 0 && mb > limit {
                            warn!(
                                memory_mb = mb,
                                limit_mb = limit,
                                "memory usage exceeds configured limit"
                            );
                        }
                    }
                }
            }
        }
    })
}

/// Refresh and read the resident set size of this process, in MB.
pub fn resident_memory_mb(system: &mut System, pid: Pid) -> u64 {
    // Must say what to refresh, otherwise sysinfo reports stale zeros.
    system.refresh_process_specifics(pid, ProcessRefreshKind::new().with_memory());

    system
        .process(pid)
        .map(|process| process.memory() / (1024 * 1024))
        .unwrap_or(0)
}
