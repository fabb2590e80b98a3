//! Batch slicing and result persistence.

use crate::tester::Tester;
use chrono::Utc;
use relaytest_common::{BatchRun, ProxyConfig, Result};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// How a driver run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOutcome {
    Completed,
    /// Cancellation arrived mid-run; whatever finished was persisted.
    Interrupted,
}

/// Summary of one driver run.
#[derive(Debug, Clone)]
pub struct DriverReport {
    pub outcome: DriverOutcome,
    pub batches: usize,
    pub total: usize,
    pub successful: usize,
}

/// Slices the candidate stream into batches and runs them in sequence.
pub struct BatchDriver {
    tester: Tester,
}

impl BatchDriver {
    pub fn new(tester: Tester) -> Self {
        Self { tester }
    }

    pub fn tester(&self) -> &Tester {
        &self.tester
    }

    /// Run every batch, persisting results along the way.
    ///
    /// With incremental save on, each batch file lands before the next
    /// batch starts; otherwise the files are written together at the end
    /// of the run. Either way an interrupted run keeps what it has.
    pub async fn run(
        &self,
        token: &CancellationToken,
        configs: Vec<ProxyConfig>,
    ) -> Result<DriverReport> {
        let config = self.tester.config();
        let results_dir = config.results_dir();
        let batch_count = configs.len().div_ceil(config.batch_size);
        info!(
            candidates = configs.len(),
            batches = batch_count,
            batch_size = config.batch_size,
            "starting driver run"
        );

        let mut report = DriverReport {
            outcome: DriverOutcome::Completed,
            batches: 0,
            total: 0,
            successful: 0,
        };
        let mut deferred: Vec<BatchRun> = Vec::new();

        for (i, chunk) in configs.chunks(config.batch_size).enumerate() {
            if token.is_cancelled() {
                report.outcome = DriverOutcome::Interrupted;
                break;
            }

            let batch_id = (i + 1) as u64;
            let started = Utc::now();
            let results = self.tester.test_batch(token, batch_id, chunk.to_vec()).await;
            let run = BatchRun {
                batch_id,
                configs: chunk.len(),
                results,
                started,
                finished: Utc::now(),
            };

            report.batches += 1;
            report.total += run.results.len();
            report.successful += run.results.iter().filter(|r| r.result.is_success()).count();

            if config.incremental_save {
                save_batch(&results_dir, &run)?;
            } else {
                deferred.push(run);
            }

            if token.is_cancelled() {
                report.outcome = DriverOutcome::Interrupted;
                break;
            }
        }

        for run in &deferred {
            save_batch(&results_dir, run)?;
        }

        let interrupted = report.outcome == DriverOutcome::Interrupted;
        info!(
            batches = report.batches,
            total = report.total,
            successful = report.successful,
            interrupted,
            "driver run finished"
        );
        Ok(report)
    }
}

/// Write one batch's result array as `result_<batchId>.json`.
pub fn save_batch(dir: &Path, run: &BatchRun) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("result_{}.json", run.batch_id));
    let body = serde_json::to_vec_pretty(&run.results)?;
    std::fs::write(&path, body)?;
    info!(path = %path.display(), results = run.results.len(), "batch results saved");
    Ok(path)
}
