//! Environment-driven tester configuration.

use crate::errors::{Result, TesterError};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default probe target; responds 204 with an empty body.
pub const DEFAULT_PROBE_URL: &str = "http://www.gstatic.com/generate_204";

/// Tester configuration.
///
/// `from_env` reads the recognized `XRAY_PATH` / `PROXY_*` variables and
/// falls back to the defaults below. Unset is fine everywhere except
/// `XRAY_PATH`, which `validate` rejects before any batch starts.
#[derive(Debug, Clone)]
pub struct TesterConfig {
    /// Path of the proxy core binary, invoked as `<path> run -c <config>`.
    pub xray_path: PathBuf,
    pub max_workers: usize,
    /// Per-candidate probe deadline.
    pub timeout: Duration,
    pub batch_size: usize,
    /// Persist each batch result file as soon as the batch finishes.
    pub incremental_save: bool,
    pub data_dir: PathBuf,
    pub config_dir: PathBuf,
    pub log_dir: PathBuf,
    /// Leasable port range `[start_port, end_port)`.
    pub start_port: u16,
    pub end_port: u16,
    /// Drain window granted to in-flight tasks after cancellation.
    pub graceful_timeout: Duration,
    /// Resident memory ceiling for admission; 0 disables the memory gate.
    pub max_memory_mb: u64,
    pub enable_metrics: bool,
    pub metrics_port: u16,
    pub probe_url: String,
}

impl Default for TesterConfig {
    fn default() -> Self {
        Self {
            xray_path: PathBuf::new(),
            max_workers: 100,
            timeout: Duration::from_secs(3),
            batch_size: 100,
            incremental_save: true,
            data_dir: PathBuf::from("../data"),
            config_dir: PathBuf::from("../config"),
            log_dir: PathBuf::from("../log"),
            start_port: 10000,
            end_port: 20000,
            graceful_timeout: Duration::from_secs(5),
            max_memory_mb: 1024,
            enable_metrics: false,
            metrics_port: 8080,
            probe_url: DEFAULT_PROBE_URL.to_string(),
        }
    }
}

impl TesterConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            xray_path: PathBuf::from(env_or("XRAY_PATH", "")),
            max_workers: env_parse_or("PROXY_MAX_WORKERS", defaults.max_workers)?,
            timeout: Duration::from_secs(env_parse_or("PROXY_TIMEOUT", 3u64)?),
            batch_size: env_parse_or("PROXY_BATCH_SIZE", defaults.batch_size)?,
            incremental_save: env_bool_or("PROXY_INCREMENTAL_SAVE", true)?,
            data_dir: PathBuf::from(env_or("PROXY_DATA_DIR", "../data")),
            config_dir: PathBuf::from(env_or("PROXY_CONFIG_DIR", "../config")),
            log_dir: PathBuf::from(env_or("PROXY_LOG_DIR", "../log")),
            start_port: env_parse_or("PROXY_START_PORT", defaults.start_port)?,
            end_port: env_parse_or("PROXY_END_PORT", defaults.end_port)?,
            graceful_timeout: defaults.graceful_timeout,
            max_memory_mb: env_parse_or("PROXY_MAX_MEMORY_MB", defaults.max_memory_mb)?,
            enable_metrics: env_bool_or("PROXY_ENABLE_METRICS", false)?,
            metrics_port: env_parse_or("PROXY_METRICS_PORT", defaults.metrics_port)?,
            probe_url: env_or("PROXY_PROBE_URL", DEFAULT_PROBE_URL),
        })
    }

    /// Reject configurations that cannot run any batch at all.
    pub fn validate(&self) -> Result<()> {
        if self.xray_path.as_os_str().is_empty() {
            return Err(TesterError::config("XRAY_PATH is required"));
        }
        if self.start_port >= self.end_port {
            return Err(TesterError::config(format!(
                "port range [{}, {}) is empty",
                self.start_port, self.end_port
            )));
        }
        if self.max_workers == 0 {
            return Err(TesterError::config("PROXY_MAX_WORKERS must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(TesterError::config("PROXY_BATCH_SIZE must be at least 1"));
        }
        Ok(())
    }

    /// Directory the per-batch result files are written into.
    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("working_json")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| {
            TesterError::config(format!("{} has invalid value {:?}", key, raw))
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool_or(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(TesterError::config(format!(
                "{} has invalid boolean value {:?}",
                key, raw
            ))),
        },
        Err(_) => Ok(default),
    }
}
