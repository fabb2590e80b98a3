//! Shared scaffolding for end-to-end scenarios.
//!
//! Scenarios drive the real [`Tester`] against the `stub-core` binary
//! built alongside the workspace. Stub fault injection goes through
//! `STUB_*` environment variables, which child processes inherit; the
//! [`StubEnv`] guard serializes scenarios so one test's knobs never leak
//! into another's children.

use relaytest_common::{Protocol, ProxyConfig, TesterConfig};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;

static STUB_ENV_LOCK: Mutex<()> = Mutex::new(());

const STUB_VARS: [&str; 3] = [
    "STUB_STARTUP_DELAY_MS",
    "STUB_RESPONSE_DELAY_MS",
    "STUB_EXIT_EARLY",
];

/// Locate the stub core built by `cargo test` for this workspace.
pub fn stub_core_path() -> PathBuf {
    let mut path = std::env::current_exe().expect("current test executable");
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push(format!("stub-core{}", std::env::consts::EXE_SUFFIX));
    assert!(
        path.exists(),
        "stub-core not found at {} (build the workspace first)",
        path.display()
    );
    path
}

/// Serializes stub-driven scenarios and scrubs `STUB_*` state.
pub struct StubEnv {
    _guard: MutexGuard<'static, ()>,
}

impl StubEnv {
    pub fn lock() -> Self {
        let guard = STUB_ENV_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for key in STUB_VARS {
            std::env::remove_var(key);
        }
        Self { _guard: guard }
    }

    pub fn set(&self, key: &str, value: &str) {
        std::env::set_var(key, value);
    }
}

impl Drop for StubEnv {
    fn drop(&mut self) {
        for key in STUB_VARS {
            std::env::remove_var(key);
        }
    }
}

/// Tester configuration pointed at the stub core and scratch dirs.
pub fn scenario_config(scratch: &TempDir, start_port: u16, end_port: u16) -> TesterConfig {
    let config_dir = scratch.path().join("config");
    std::fs::create_dir_all(&config_dir).expect("create config dir");

    TesterConfig {
        xray_path: stub_core_path(),
        max_workers: 4,
        timeout: Duration::from_secs(5),
        batch_size: 100,
        incremental_save: true,
        data_dir: scratch.path().join("data"),
        config_dir,
        log_dir: scratch.path().join("log"),
        start_port,
        end_port,
        graceful_timeout: Duration::from_secs(2),
        max_memory_mb: 0,
        enable_metrics: false,
        metrics_port: 0,
        probe_url: "http://ping.invalid/generate_204".to_string(),
    }
}

/// A batch of socks candidates; the stub never dials the fake upstream.
pub fn socks_candidates(count: usize) -> Vec<ProxyConfig> {
    (0..count)
        .map(|i| ProxyConfig::new(format!("node-{}", i), Protocol::Socks, "192.0.2.10", 1080))
        .collect()
}
