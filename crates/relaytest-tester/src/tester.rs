//! Per-batch test orchestration.
//!
//! One batch fans its candidates out as pool jobs. Each job owns its
//! port lease and core process exclusively; results flow back over a
//! channel buffered to the batch size, so emitters never block during
//! shutdown. On cancellation the collector grants in-flight tasks the
//! graceful window, then aborts the pool and back-fills whatever is
//! still missing as `cancelled`.

use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use relaytest_common::{
    ProxyConfig, Result, TesterConfig, TestResult, TestResultData,
};
use relaytest_metrics::Metrics;
use relaytest_pool::{Admission, AdmissionController, Job, SubmitError, WorkerPool};
use relaytest_ports::PortManager;
use relaytest_probe::{probe_for, ProbeClass, ProbeTarget};
use relaytest_process::{render_core_config, CoreLaunchSpec, CoreProcess};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause before re-offering a job to a full pool queue.
const SUBMIT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Batch test orchestrator.
pub struct Tester {
    config: TesterConfig,
    ports: Arc<PortManager>,
    metrics: Arc<Metrics>,
    admission: Arc<AdmissionController>,
    target: ProbeTarget,
    abort_token: CancellationToken,
}

/// Everything a single test task needs, cloned into its job future.
#[derive(Clone)]
struct TaskEnv {
    ports: Arc<PortManager>,
    metrics: Arc<Metrics>,
    admission: Arc<AdmissionController>,
    target: ProbeTarget,
    probe_timeout: Duration,
    core_binary: PathBuf,
    config_dir: PathBuf,
}

impl Tester {
    pub fn new(config: TesterConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let target = ProbeTarget::from_url(&config.probe_url)?;
        let ports = PortManager::new(config.start_port, config.end_port);
        let admission = Arc::new(AdmissionController::new(
            config.max_memory_mb,
            config.max_workers,
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config,
            ports,
            metrics,
            admission,
            target,
            abort_token: CancellationToken::new(),
        })
    }

    /// Wire the supervisor's hard-abort token; it cuts the drain window
    /// short when a second signal arrives.
    pub fn with_abort_token(mut self, token: CancellationToken) -> Self {
        self.abort_token = token;
        self
    }

    pub fn config(&self) -> &TesterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn ports(&self) -> &Arc<PortManager> {
        &self.ports
    }

    /// Test one batch and return exactly one result per candidate.
    ///
    /// Result ordering matches submission order, but that is incidental;
    /// callers must not rely on it.
    pub async fn test_batch(
        &self,
        token: &CancellationToken,
        batch_id: u64,
        configs: Vec<ProxyConfig>,
    ) -> Vec<TestResultData> {
        let n = configs.len();
        if n == 0 {
            return Vec::new();
        }

        info!(batch_id, candidates = n, "starting batch");
        let workers = self.config.max_workers.min(n);
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, TestResultData)>(n);
        let pool = WorkerPool::new(workers, result_tx.clone());

        let env = TaskEnv {
            ports: Arc::clone(&self.ports),
            metrics: Arc::clone(&self.metrics),
            admission: Arc::clone(&self.admission),
            target: self.target.clone(),
            probe_timeout: self.config.timeout,
            core_binary: self.config.xray_path.clone(),
            config_dir: self.config.config_dir.clone(),
        };

        for (idx, config) in configs.iter().enumerate() {
            let mut job = make_job(env.clone(), token.clone(), batch_id, idx, config.clone());

            loop {
                if token.is_cancelled() {
                    let data = TestResultData::outcome(
                        config.clone(),
                        batch_id,
                        TestResult::Cancelled,
                        "batch cancelled before submission",
                    );
                    let _ = result_tx.try_send((idx, data));
                    break;
                }

                match pool.submit(job) {
                    Ok(()) => break,
                    Err(SubmitError::QueueFull(returned)) => {
                        job = returned;
                        tokio::time::sleep(SUBMIT_RETRY_DELAY).await;
                    }
                    Err(SubmitError::ShuttingDown(_)) => {
                        let data = TestResultData::outcome(
                            config.clone(),
                            batch_id,
                            TestResult::Cancelled,
                            "worker pool shutting down",
                        );
                        let _ = result_tx.try_send((idx, data));
                        break;
                    }
                }
            }
        }
        drop(result_tx);

        // Collect until the batch is complete, cancellation drains it, or
        // a hard abort cuts the drain short.
        #[derive(Clone, Copy)]
        enum Phase {
            Live,
            Draining(Instant),
        }
        let mut phase = Phase::Live;
        let mut slots: Vec<Option<TestResultData>> = (0..n).map(|_| None).collect();
        let mut received = 0usize;

        while received < n {
            match phase {
                Phase::Live => {
                    tokio::select! {
                        biased;
                        _ = self.abort_token.cancelled() => {
                            phase = Phase::Draining(Instant::now());
                        }
                        _ = token.cancelled() => {
                            info!(batch_id, "batch cancelled, draining in-flight tasks");
                            phase = Phase::Draining(Instant::now() + self.config.graceful_timeout);
                        }
                        maybe = result_rx.recv() => match maybe {
                            Some((idx, data)) => {
                                store(&mut slots, &mut received, &self.metrics, idx, data);
                            }
                            None => break,
                        }
                    }
                }
                Phase::Draining(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    tokio::select! {
                        biased;
                        _ = self.abort_token.cancelled() => break,
                        res = tokio::time::timeout(remaining, result_rx.recv()) => match res {
                            Ok(Some((idx, data))) => {
                                store(&mut slots, &mut received, &self.metrics, idx, data);
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                }
            }
        }

        let interrupted = received < n;
        if interrupted {
            pool.abort().await;
        } else {
            pool.stop().await;
        }

        // Tasks that finished between the drain deadline and the pool
        // teardown still have results sitting in the channel buffer.
        while let Ok((idx, data)) = result_rx.try_recv() {
            store(&mut slots, &mut received, &self.metrics, idx, data);
        }

        let results: Vec<TestResultData> = slots
            .into_iter()
            .zip(configs)
            .map(|(slot, config)| {
                slot.unwrap_or_else(|| {
                    let data = TestResultData::outcome(
                        config,
                        batch_id,
                        TestResult::Cancelled,
                        "cancelled during shutdown drain",
                    );
                    self.metrics.record(&data);
                    data
                })
            })
            .collect();

        let outstanding = self.ports.outstanding();
        if outstanding != 0 {
            warn!(batch_id, outstanding, "port leases outstanding after batch");
            self.ports.release_all();
        }

        let successful = results.iter().filter(|r| r.result.is_success()).count();
        info!(batch_id, successful, total = results.len(), "batch complete");
        results
    }
}

fn store(
    slots: &mut [Option<TestResultData>],
    received: &mut usize,
    metrics: &Metrics,
    idx: usize,
    data: TestResultData,
) {
    if idx < slots.len() && slots[idx].is_none() {
        metrics.record(&data);
        slots[idx] = Some(data);
        *received += 1;
    }
}

fn make_job(
    env: TaskEnv,
    token: CancellationToken,
    batch_id: u64,
    idx: usize,
    config: ProxyConfig,
) -> Job<(usize, TestResultData)> {
    let label = format!("test:{}", config.tag);
    let panic_config = config.clone();

    let work = async move {
        let data = run_one(env, token, batch_id, config).await;
        (idx, data)
    }
    .boxed();

    Job {
        label,
        work,
        on_panic: Box::new(move |message| {
            let data = TestResultData::outcome(
                panic_config,
                batch_id,
                TestResult::Failure,
                format!("panic: {}", message),
            );
            (idx, data)
        }),
    }
}

/// One candidate, start to finish: admission, port lease, core launch,
/// probe, teardown. Every wait in here is bound to the batch token.
async fn run_one(
    env: TaskEnv,
    token: CancellationToken,
    batch_id: u64,
    mut config: ProxyConfig,
) -> TestResultData {
    let started_at = Utc::now();

    if token.is_cancelled() {
        return finish(
            config,
            batch_id,
            started_at,
            TestResult::Cancelled,
            "batch cancelled before start",
        );
    }

    if let Admission::Denied(reason) = env.admission.can_admit() {
        debug!(tag = %config.tag, %reason, "admission denied");
        return finish(config, batch_id, started_at, TestResult::ResourceExhausted, reason);
    }

    let lease = match env.ports.acquire(&token).await {
        Ok(lease) => lease,
        Err(e) => {
            return finish(config, batch_id, started_at, e.test_result(), e.to_string());
        }
    };
    config.local_port = Some(lease.port());

    let rendered = match render_core_config(&config, lease.port()) {
        Ok(value) => value,
        Err(e) => {
            let data = finish(config, batch_id, started_at, e.test_result(), e.to_string());
            lease.release();
            return data;
        }
    };

    let spec = CoreLaunchSpec {
        core_binary: env.core_binary.clone(),
        config_dir: env.config_dir.clone(),
        tag: config.tag.clone(),
        port: lease.port(),
        config: rendered,
    };
    let mut core = match CoreProcess::launch(&token, spec, Arc::clone(&env.metrics)).await {
        Ok(core) => core,
        Err(e) => {
            let data = finish(config, batch_id, started_at, e.test_result(), e.to_string());
            lease.release();
            return data;
        }
    };

    let probe = probe_for(config.protocol);
    let outcome = probe
        .probe(&token, core.endpoint(), &env.target, env.probe_timeout)
        .await;
    let core_tail = core.output_tail();

    core.stop().await;
    lease.release();

    match outcome.class {
        ProbeClass::Success => {
            let mut data = TestResultData::success(
                config,
                batch_id,
                outcome.response_time.unwrap_or_default(),
            );
            data.started_at = started_at;
            data.message = outcome.detail;
            data
        }
        other => {
            let kind = match other {
                ProbeClass::Timeout => TestResult::Timeout,
                ProbeClass::Cancelled => TestResult::Cancelled,
                _ => TestResult::ProbeFailed,
            };
            let mut message = outcome.detail;
            if kind == TestResult::ProbeFailed && !core_tail.is_empty() {
                message = format!("{}; core output: {}", message, core_tail);
            }
            finish(config, batch_id, started_at, kind, message)
        }
    }
}

fn finish(
    config: ProxyConfig,
    batch_id: u64,
    started_at: DateTime<Utc>,
    result: TestResult,
    message: impl Into<String>,
) -> TestResultData {
    let mut data = TestResultData::outcome(config, batch_id, result, message);
    data.started_at = started_at;
    data
}
