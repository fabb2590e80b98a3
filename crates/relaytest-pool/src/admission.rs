//! Admission gate for new test tasks.
//!
//! Bounded parallelism alone does not bound memory: per-process overhead
//! varies with the candidate config, so the pool can stay within its slot
//! count while the host runs out of RAM. The gate checks resident memory
//! and the live-process gauge right before a task would spawn a core;
//! a denied task records `resource_exhausted` without spawning anything.
//!
//! Checks are best-effort and race-tolerant: two tasks passing the gate
//! simultaneously may overshoot by one process or a few MB.

use parking_lot::Mutex;
use relaytest_metrics::{sampler, Metrics};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};

/// How long a memory reading stays fresh before the next refresh.
const MEMORY_CACHE_TTL: Duration = Duration::from_secs(1);

/// Gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied(String),
}

struct MemoryReader {
    system: System,
    pid: Pid,
    cached_mb: u64,
    read_at: Option<Instant>,
}

impl MemoryReader {
    fn resident_mb(&mut self) -> u64 {
        let stale = match self.read_at {
            Some(at) => at.elapsed() >= MEMORY_CACHE_TTL,
            None => true,
        };
        if stale {
            self.cached_mb = sampler::resident_memory_mb(&mut self.system, self.pid);
            self.read_at = Some(Instant::now());
        }
        self.cached_mb
    }
}

/// Memory / process headroom gate.
pub struct AdmissionController {
    max_memory_mb: u64,
    max_processes: usize,
    metrics: Arc<Metrics>,
    memory: Mutex<MemoryReader>,
}

impl AdmissionController {
    /// `max_memory_mb == 0` disables the memory check.
    pub fn new(max_memory_mb: u64, max_processes: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            max_memory_mb,
            max_processes,
            metrics,
            memory: Mutex::new(MemoryReader {
                system: System::new(),
                pid: Pid::from_u32(std::process::id()),
                cached_mb: 0,
                read_at: None,
            }),
        }
    }

    /// Decide whether a task may start a core process right now.
    pub fn can_admit(&self) -> Admission {
        if self.max_memory_mb > 0 {
            let resident = self.memory.lock().resident_mb();
            if resident >= self.max_memory_mb {
                return Admission::Denied(format!(
                    "resident memory {} MB exceeds limit {} MB",
                    resident, self.max_memory_mb
                ));
            }
        }

        let active = self.metrics.active_processes();
        if active >= self.max_processes as i64 {
            return Admission::Denied(format!(
                "{} active core processes at limit {}",
                active, self.max_processes
            ));
        }

        Admission::Granted
    }
}
