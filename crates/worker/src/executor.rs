//! Worker loops: claim -> aggregate -> commit or fail -> idle backoff.
//!
//! Each process runs `concurrency` independent loops sharing only the
//! store and a shutdown channel. Loops never re-raise processing
//! failures; the only ways out are the shutdown signal and a fatal
//! store error, which is surfaced so the binary can exit non-zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tallyd_core::{aggregate, RetryDecision, RetryPolicy};
use tallyd_infra::{ClaimedJob, EngineConfig, JobStore};

/// Worker runtime configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parallel loops in this process.
    pub concurrency: usize,
    /// Idle poll delay after a claim, and the doubling start point.
    pub poll_interval: Duration,
    /// Ceiling for idle-poll doubling.
    pub idle_backoff_max: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_secs(1),
            idle_backoff_max: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_engine(config: &EngineConfig) -> Self {
        Self {
            concurrency: config.worker_concurrency,
            poll_interval: config.poll_interval,
            idle_backoff_max: config.idle_backoff_max,
            retry_policy: config.retry_policy(),
        }
    }
}

/// Lifetime counters shared by every loop in the process.
#[derive(Debug, Default)]
struct WorkerStats {
    claimed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed_terminal: AtomicU64,
}

/// Point-in-time copy of the worker counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StatsSnapshot {
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed_terminal: u64,
}

impl WorkerStats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed_terminal: self.failed_terminal.load(Ordering::Relaxed),
        }
    }
}

/// A set of processing loops over one store.
pub struct Worker<S> {
    store: Arc<S>,
    config: WorkerConfig,
}

/// Handle to control running worker loops.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    fatal: watch::Receiver<bool>,
    join: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for every loop to stop.
    pub async fn shutdown(self) -> StatsSnapshot {
        let _ = self.shutdown.send(true);
        for handle in self.join {
            let _ = handle.await;
        }
        let stats = self.stats.snapshot();
        info!(?stats, "worker stopped");
        stats
    }

    /// Receiver that flips to `true` when any loop hits a fatal store
    /// error. The binary exits non-zero on that signal.
    pub fn fatal(&self) -> watch::Receiver<bool> {
        self.fatal.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl<S: JobStore + 'static> Worker<S> {
    pub fn new(store: Arc<S>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    /// Spawn the configured number of loops.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = watch::channel(false);
        let stats = Arc::new(WorkerStats::default());

        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());

        let mut join = Vec::with_capacity(self.config.concurrency.max(1));
        for slot in 0..self.config.concurrency.max(1) {
            // Identity is diagnostics only; it just has to be unique to
            // this loop for the lifetime of the process.
            let worker_id = format!("{host}-{}-{slot}", Uuid::now_v7());
            let store = self.store.clone();
            let config = self.config.clone();
            let shutdown = shutdown_rx.clone();
            let fatal = fatal_tx.clone();
            let stats = stats.clone();

            join.push(tokio::spawn(async move {
                run_loop(store, config, worker_id, shutdown, fatal, stats).await;
            }));
        }

        WorkerHandle {
            shutdown: shutdown_tx,
            fatal: fatal_rx,
            join,
            stats,
        }
    }
}

async fn run_loop<S: JobStore>(
    store: Arc<S>,
    config: WorkerConfig,
    worker_id: String,
    mut shutdown: watch::Receiver<bool>,
    fatal: watch::Sender<bool>,
    stats: Arc<WorkerStats>,
) {
    info!(worker_id = %worker_id, "worker loop started");
    let mut idle_delay = config.poll_interval;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match store.claim_next(&worker_id).await {
            Ok(Some(claimed)) => {
                idle_delay = config.poll_interval;
                stats.claimed.fetch_add(1, Ordering::Relaxed);
                if let ControlFlow::Fatal = process(&*store, &config, &worker_id, claimed, &stats).await
                {
                    let _ = fatal.send(true);
                    break;
                }
            }
            Ok(None) => {
                // No work: sleep, then double the delay up to the cap.
                if sleep_or_shutdown(&mut shutdown, idle_delay).await {
                    break;
                }
                idle_delay = (idle_delay * 2).min(config.idle_backoff_max);
            }
            Err(e) if e.is_fatal() => {
                error!(worker_id = %worker_id, error = %e, "fatal store error while claiming");
                let _ = fatal.send(true);
                break;
            }
            Err(e) => {
                // Transient claim failure: nothing was claimed, so no
                // attempt counter moved. Try again next iteration.
                warn!(worker_id = %worker_id, error = %e, "claim failed; will retry");
                if sleep_or_shutdown(&mut shutdown, config.poll_interval).await {
                    break;
                }
            }
        }
    }

    info!(worker_id = %worker_id, "worker loop stopped");
}

enum ControlFlow {
    Continue,
    Fatal,
}

async fn process<S: JobStore>(
    store: &S,
    config: &WorkerConfig,
    worker_id: &str,
    claimed: ClaimedJob,
    stats: &WorkerStats,
) -> ControlFlow {
    let job_id = claimed.job.id;
    let attempt = claimed.job.attempt.max(0) as u32;

    debug!(
        worker_id = %worker_id,
        job_id = %job_id,
        attempt,
        events = claimed.events.len(),
        "processing claimed job"
    );

    let rows = aggregate(&claimed.events);

    let failure = match store.complete(job_id, &rows).await {
        Ok(()) => {
            stats.succeeded.fetch_add(1, Ordering::Relaxed);
            debug!(worker_id = %worker_id, job_id = %job_id, "job succeeded");
            return ControlFlow::Continue;
        }
        Err(e) if e.is_fatal() => {
            error!(worker_id = %worker_id, job_id = %job_id, error = %e, "fatal store error");
            return ControlFlow::Fatal;
        }
        Err(e) => e,
    };

    // Failure path: decide and persist in a fresh transaction. Never
    // re-raise; the loop always continues.
    let decision = config.retry_policy.decide(attempt, failure.to_string());
    match &decision {
        RetryDecision::Retry { delay, .. } => {
            stats.retried.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker_id = %worker_id,
                job_id = %job_id,
                attempt,
                delay_secs = delay.as_secs(),
                error = %failure,
                "job failed; scheduling retry"
            );
        }
        RetryDecision::GiveUp { .. } => {
            stats.failed_terminal.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker_id = %worker_id,
                job_id = %job_id,
                attempt,
                error = %failure,
                "job failed terminally"
            );
        }
    }

    match store.fail(job_id, &decision).await {
        Ok(()) => ControlFlow::Continue,
        Err(e) if e.is_fatal() => {
            error!(worker_id = %worker_id, job_id = %job_id, error = %e, "fatal store error");
            ControlFlow::Fatal
        }
        Err(e) => {
            // The lock will go stale and the job will be reclaimed;
            // at-least-once semantics cover us here.
            warn!(worker_id = %worker_id, job_id = %job_id, error = %e, "could not persist retry decision");
            ControlFlow::Continue
        }
    }
}

/// Sleep for `delay`, waking early on shutdown. Returns `true` when the
/// loop should exit. A dropped sender counts as shutdown.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use chrono::Utc;

    use tallyd_core::{EventDraft, JobId, JobRecord, JobStatus, NewSubmission, ResultRow};
    use tallyd_infra::{InMemoryJobStore, StoreError, SubmitOutcome};

    fn submission(tenant: &str, types: &[&str]) -> NewSubmission {
        NewSubmission::build(
            tenant,
            None,
            types
                .iter()
                .map(|t| EventDraft {
                    event_type: (*t).to_string(),
                    occurred_at: Some(Utc::now()),
                    payload: serde_json::json!({}),
                })
                .collect(),
        )
        .expect("valid submission")
    }

    fn fast_config(retry_policy: RetryPolicy) -> WorkerConfig {
        WorkerConfig {
            concurrency: 1,
            poll_interval: Duration::from_millis(5),
            idle_backoff_max: Duration::from_millis(20),
            retry_policy,
        }
    }

    /// Poll until `check` passes or the deadline expires.
    async fn eventually<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..500 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    #[tokio::test]
    async fn backlog_is_processed_to_success() {
        let store = Arc::new(InMemoryJobStore::default());
        let out = store
            .submit(&submission("t1", &["a", "b", "a"]))
            .await
            .unwrap();

        let handle = Worker::new(store.clone(), fast_config(RetryPolicy::default())).spawn();

        eventually("job to succeed", || {
            let store = store.clone();
            async move {
                matches!(
                    store.get_job(out.job_id).await.unwrap(),
                    Some(job) if job.status == JobStatus::Succeeded
                )
            }
        })
        .await;

        let results = store.get_results(out.job_id).await.unwrap().unwrap();
        assert_eq!(
            results,
            vec![
                ResultRow { event_type: "a".into(), count: 2 },
                ResultRow { event_type: "b".into(), count: 1 },
            ]
        );

        let job = store.get_job(out.job_id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        assert!(job.processed_at.is_some());

        let stats = handle.shutdown().await;
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn two_workers_race_on_backlog_without_double_processing() {
        let store = Arc::new(InMemoryJobStore::default());
        let mut ids = Vec::new();
        for i in 0..100 {
            let out = store
                .submit(&submission("t1", &[format!("e{i}").as_str()]))
                .await
                .unwrap();
            ids.push(out.job_id);
        }

        let config = WorkerConfig {
            concurrency: 2,
            ..fast_config(RetryPolicy::default())
        };
        let handle = Worker::new(store.clone(), config).spawn();

        eventually("all jobs to succeed", || {
            let store = store.clone();
            async move {
                store
                    .all_jobs()
                    .await
                    .iter()
                    .all(|j| j.status == JobStatus::Succeeded)
            }
        })
        .await;

        let mut total_rows = 0;
        for id in &ids {
            let job = store.get_job(*id).await.unwrap().unwrap();
            assert_eq!(job.attempt, 1, "no job should have been reclaimed");
            total_rows += store.get_results(*id).await.unwrap().unwrap().len();
        }
        assert_eq!(total_rows, 100);

        let stats = handle.shutdown().await;
        assert_eq!(stats.succeeded, 100);
        assert_eq!(stats.claimed, 100);
    }

    /// Delegates to the in-memory store but fails `complete` a fixed
    /// number of times, standing in for an aggregation/commit crash.
    struct FailingStore {
        inner: InMemoryJobStore,
        remaining_failures: AtomicU32,
    }

    impl FailingStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryJobStore::default(),
                remaining_failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl JobStore for FailingStore {
        async fn submit(&self, s: &NewSubmission) -> Result<SubmitOutcome, StoreError> {
            self.inner.submit(s).await
        }
        async fn claim_next(&self, w: &str) -> Result<Option<tallyd_infra::ClaimedJob>, StoreError> {
            self.inner.claim_next(w).await
        }
        async fn complete(&self, id: JobId, rows: &[ResultRow]) -> Result<(), StoreError> {
            let left = self.remaining_failures.load(Ordering::SeqCst);
            if left > 0 {
                self.remaining_failures.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Transient("injected commit failure".into()));
            }
            self.inner.complete(id, rows).await
        }
        async fn fail(&self, id: JobId, d: &RetryDecision) -> Result<(), StoreError> {
            self.inner.fail(id, d).await
        }
        async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
            self.inner.get_job(id).await
        }
        async fn get_results(&self, id: JobId) -> Result<Option<Vec<ResultRow>>, StoreError> {
            self.inner.get_results(id).await
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_retries_into_failed() {
        // Every completion fails; with max_attempts = 3 and zero
        // backoff the job must land on Failed with attempt = 3.
        let store = Arc::new(FailingStore::new(u32::MAX));
        let out = store.submit(&submission("t1", &["a"])).await.unwrap();

        let policy = RetryPolicy::new(3, Duration::from_secs(0));
        let handle = Worker::new(store.clone(), fast_config(policy)).spawn();

        eventually("job to fail terminally", || {
            let store = store.clone();
            async move {
                matches!(
                    store.get_job(out.job_id).await.unwrap(),
                    Some(job) if job.status == JobStatus::Failed
                )
            }
        })
        .await;

        let job = store.get_job(out.job_id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 3);
        assert!(job.error.as_deref().unwrap().contains("injected commit failure"));
        assert!(job.available_at.is_none());
        assert!(job.locked_at.is_none() && job.locked_by.is_none());

        let stats = handle.shutdown().await;
        assert_eq!(stats.failed_terminal, 1);
        assert_eq!(stats.retried, 2);
    }

    #[tokio::test]
    async fn transient_failure_then_recovery_succeeds_on_retry() {
        // Fail once, then recover: fail-then-immediate-reclaim.
        let store = Arc::new(FailingStore::new(1));
        let out = store.submit(&submission("t1", &["a"])).await.unwrap();

        let policy = RetryPolicy::new(5, Duration::from_secs(0));
        let handle = Worker::new(store.clone(), fast_config(policy)).spawn();

        eventually("job to succeed after one retry", || {
            let store = store.clone();
            async move {
                matches!(
                    store.get_job(out.job_id).await.unwrap(),
                    Some(job) if job.status == JobStatus::Succeeded
                )
            }
        })
        .await;

        let job = store.get_job(out.job_id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        // A successful run clears the recorded failure.
        assert!(job.error.is_none());

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed_and_job_completes() {
        let store = Arc::new(InMemoryJobStore::new(Duration::from_secs(300)));
        let out = store.submit(&submission("t1", &["a"])).await.unwrap();

        // A "dead" worker claims the job and vanishes.
        let claimed = store.claim_next("dead-worker").await.unwrap().unwrap();
        assert_eq!(claimed.job.attempt, 1);
        store.backdate_lock(out.job_id, Duration::from_secs(600)).await;

        let handle = Worker::new(store.clone(), fast_config(RetryPolicy::default())).spawn();

        eventually("job to be reclaimed and succeed", || {
            let store = store.clone();
            async move {
                matches!(
                    store.get_job(out.job_id).await.unwrap(),
                    Some(job) if job.status == JobStatus::Succeeded
                )
            }
        })
        .await;

        let job = store.get_job(out.job_id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_prompt_when_idle() {
        let store = Arc::new(InMemoryJobStore::default());
        let handle = Worker::new(store, fast_config(RetryPolicy::default())).spawn();

        // Give the loop a moment to reach its idle sleep.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let done = tokio::time::timeout(Duration::from_secs(1), handle.shutdown()).await;
        assert!(done.is_ok(), "shutdown did not complete promptly");
    }

    #[tokio::test]
    async fn aggregation_output_is_deterministic_across_reruns() {
        // Running the worker path twice over the same claimed job
        // leaves identical result rows (idempotent result writes).
        let store = Arc::new(InMemoryJobStore::default());
        let out = store
            .submit(&submission("t1", &["B", "a", "b", "A"]))
            .await
            .unwrap();

        let claimed = store.claim_next("w1").await.unwrap().unwrap();
        let rows_first = aggregate(&claimed.events);
        store.complete(out.job_id, &rows_first).await.unwrap();
        let read_first = store.get_results(out.job_id).await.unwrap().unwrap();

        let rows_second = aggregate(&claimed.events);
        store.complete(out.job_id, &rows_second).await.unwrap();
        let read_second = store.get_results(out.job_id).await.unwrap().unwrap();

        assert_eq!(read_first, read_second);
    }
}
