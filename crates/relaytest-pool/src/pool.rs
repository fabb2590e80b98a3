//! Fixed-concurrency worker pool with panic isolation.
//!
//! A dispatcher task pulls jobs off a bounded channel and runs each one
//! on its own spawned task, with concurrency capped by a semaphore. A
//! panicking job is converted into a fallback value by its `on_panic`
//! hook and reported like any other completion, so one bad task never
//! takes a worker slot down with it.

use futures::future::{BoxFuture, FutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One unit of work plus its panic fallback.
pub struct Job<R> {
    /// Short label for logging.
    pub label: String,
    pub work: BoxFuture<'static, R>,
    /// Builds the completion value reported when `work` panics.
    pub on_panic: Box<dyn FnOnce(String) -> R + Send>,
}

/// Submission rejection; the job is handed back for retry.
pub enum SubmitError<R> {
    QueueFull(Job<R>),
    ShuttingDown(Job<R>),
}

impl<R> std::fmt::Debug for SubmitError<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::QueueFull(_) => write!(f, "QueueFull"),
            SubmitError::ShuttingDown(_) => write!(f, "ShuttingDown"),
        }
    }
}

/// Bounded concurrent executor.
///
/// Completions are pushed to the `completed_tx` channel given at
/// construction; the pool itself never blocks on a full completion
/// channel as long as the creator sized it for the whole batch.
pub struct WorkerPool<R> {
    job_tx: mpsc::Sender<Job<R>>,
    token: CancellationToken,
    dispatcher: JoinHandle<()>,
}

impl<R: Send + 'static> WorkerPool<R> {
    /// Start a pool of `max_workers` slots with a queue of twice that.
    pub fn new(max_workers: usize, completed_tx: mpsc::Sender<R>) -> Self {
        let max_workers = max_workers.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job<R>>(max_workers * 2);
        let token = CancellationToken::new();

        let dispatcher = tokio::spawn(Self::dispatcher_loop(
            job_rx,
            Arc::new(Semaphore::new(max_workers)),
            completed_tx,
            token.clone(),
            max_workers,
        ));

        debug!(max_workers, "worker pool started");
        WorkerPool {
            job_tx,
            token,
            dispatcher,
        }
    }

    /// Non-blocking submission. A rejected job comes back in the error so
    /// the caller can retry after a short delay.
    pub fn submit(&self, job: Job<R>) -> Result<(), SubmitError<R>> {
        if self.token.is_cancelled() {
            return Err(SubmitError::ShuttingDown(job));
        }
        match self.job_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => Err(SubmitError::QueueFull(job)),
            Err(TrySendError::Closed(job)) => Err(SubmitError::ShuttingDown(job)),
        }
    }

    /// Stop accepting jobs and wait for everything in flight to finish.
    pub async fn stop(self) {
        drop(self.job_tx);
        let _ = self.dispatcher.await;
        debug!("worker pool stopped");
    }

    /// Cancel in-flight jobs and tear the pool down.
    ///
    /// Job futures are aborted at their next suspension point; resources
    /// they own are released by their drop glue.
    pub async fn abort(self) {
        self.token.cancel();
        drop(self.job_tx);
        let _ = self.dispatcher.await;
        debug!("worker pool aborted");
    }

    async fn dispatcher_loop(
        mut job_rx: mpsc::Receiver<Job<R>>,
        semaphore: Arc<Semaphore>,
        completed_tx: mpsc::Sender<R>,
        token: CancellationToken,
        max_in_flight: usize,
    ) {
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                maybe_job = job_rx.recv() => {
                    let Some(job) = maybe_job else { break };

                    let permit = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        permit = semaphore.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };

                    let completed_tx = completed_tx.clone();
                    join_set.spawn(async move {
                        let _permit = permit;
                        let out = run_with_panic_capture(job).await;
                        if completed_tx.send(out).await.is_err() {
                            debug!("completion receiver dropped before job finished");
                        }
                    });

                    // Joined tasks linger in the set until polled; keep it
                    // from growing past the concurrency bound.
                    while join_set.len() > max_in_flight {
                        let _ = join_set.join_next().await;
                    }
                }

                Some(res) = join_set.join_next(), if !join_set.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            warn!("pool task panicked outside capture: {}", e);
                        }
                    }
                }
            }
        }

        if token.is_cancelled() {
            join_set.shutdown().await;
        } else {
            while join_set.join_next().await.is_some() {}
        }
    }
}

async fn run_with_panic_capture<R>(job: Job<R>) -> R {
    let Job {
        label,
        work,
        on_panic,
    } = job;

    match AssertUnwindSafe(work).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload);
            warn!(task = %label, "worker task panicked: {}", message);
            on_panic(message)
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn job<R: Send + 'static>(
        label: &str,
        work: impl std::future::Future<Output = R> + Send + 'static,
        on_panic: impl FnOnce(String) -> R + Send + 'static,
    ) -> Job<R> {
        Job {
            label: label.to_string(),
            work: work.boxed(),
            on_panic: Box::new(on_panic),
        }
    }

    /// Submit with retry on a transiently full queue.
    async fn submit_ok<R: Send + 'static>(pool: &WorkerPool<R>, mut job: Job<R>) {
        loop {
            match pool.submit(job) {
                Ok(()) => return,
                Err(SubmitError::QueueFull(returned)) => {
                    job = returned;
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Err(SubmitError::ShuttingDown(_)) => panic!("pool shutting down"),
            }
        }
    }

    #[tokio::test]
    async fn executes_submitted_jobs() {
        let (tx, mut rx) = mpsc::channel(8);
        let pool = WorkerPool::new(2, tx);

        for i in 0..5u32 {
            submit_ok(&pool, job(&format!("j{}", i), async move { i * 2 }, |_| 0)).await;
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 2, 4, 6, 8]);

        pool.stop().await;
    }

    #[tokio::test]
    async fn panics_become_fallback_results() {
        let (tx, mut rx) = mpsc::channel(8);
        let pool = WorkerPool::new(1, tx);

        pool.submit(job(
            "boom",
            async { panic!("kaboom") },
            |msg| format!("panic: {}", msg),
        ))
        .unwrap_or_else(|_| panic!("submit rejected"));

        pool.submit(job("next", async { "ok".to_string() }, |_| String::new()))
            .unwrap_or_else(|_| panic!("submit rejected"));

        let mut results = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        results.sort();
        assert_eq!(results, vec!["ok".to_string(), "panic: kaboom".to_string()]);

        pool.stop().await;
    }

    #[tokio::test]
    async fn full_queue_rejects_and_returns_job() {
        let (tx, mut rx) = mpsc::channel(64);
        let pool = WorkerPool::new(1, tx);
        let gate = Arc::new(tokio::sync::Semaphore::new(0));

        // One job occupies the single slot; two more fill the queue.
        for i in 0..3 {
            let gate = gate.clone();
            submit_ok(&pool, job(&format!("hold{}", i), async move {
                let _permit = gate.acquire().await;
                0u32
            }, |_| 0))
            .await;
        }
        // Give the dispatcher a moment to pull from the queue, then flood.
        tokio::time::sleep(Duration::from_millis(30)).await;

        let mut rejected = false;
        for i in 0..4 {
            let gate = gate.clone();
            let result = pool.submit(job(&format!("extra{}", i), async move {
                let _permit = gate.acquire().await;
                0u32
            }, |_| 0));
            if let Err(SubmitError::QueueFull(_)) = result {
                rejected = true;
                break;
            }
        }
        assert!(rejected, "queue never reported full");

        gate.add_permits(64);
        // Drain whatever was accepted so stop() can finish.
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_jobs() {
        let (tx, mut rx) = mpsc::channel(8);
        let pool = WorkerPool::new(2, tx);
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            let counter = counter.clone();
            pool.submit(job(&format!("slow{}", i), async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }, |_| ()))
            .unwrap_or_else(|_| panic!("submit rejected"));
        }

        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        pool.stop().await;
        drain.await.unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn abort_cuts_in_flight_jobs_short() {
        let (tx, mut rx) = mpsc::channel(8);
        let pool = WorkerPool::new(2, tx);
        let counter = Arc::new(AtomicUsize::new(0));

        for i in 0..2 {
            let counter = counter.clone();
            pool.submit(job(&format!("stuck{}", i), async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }, |_| ()))
            .unwrap_or_else(|_| panic!("submit rejected"));
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        tokio::time::timeout(Duration::from_secs(1), pool.abort())
            .await
            .expect("abort did not finish promptly");
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }
}
