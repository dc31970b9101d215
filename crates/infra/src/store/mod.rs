//! The job store: the single abstraction boundary over persistence.
//!
//! Two implementations honour the same transactional contract: the
//! Postgres store used in production and an in-memory fake used by
//! worker and API tests.

use async_trait::async_trait;
use thiserror::Error;

use tallyd_core::{JobId, JobRecord, NewSubmission, RawEvent, ResultRow, RetryDecision};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PgJobStore;

/// Outcome of a submission: the job id, and whether it was collapsed
/// onto a pre-existing job via the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub job_id: JobId,
    pub duplicate: bool,
}

/// A claimed job handed to exactly one worker, with its raw events.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: JobRecord,
    pub events: Vec<RawEvent>,
}

/// Store failures, classified the way the engine reacts to them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique violation; recoverable by the caller (duplicate submit).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connection loss, pool exhaustion, serialization failure. The
    /// loop retries on its next iteration.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Schema or permission problems. The process exits non-zero.
    #[error("fatal store error: {0}")]
    Fatal(String),

    #[error("job not found: {0}")]
    NotFound(JobId),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Fatal(_))
    }
}

/// Transactional persistence for jobs, events, and results.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically create a job with its events, or report the existing
    /// job for the same `(tenant, idempotency key)`.
    async fn submit(&self, submission: &NewSubmission) -> Result<SubmitOutcome, StoreError>;

    /// Hand at most one eligible job to this worker, locking it and
    /// advancing its attempt counter. `None` means no work right now.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>, StoreError>;

    /// Replace the job's result rows and mark it Succeeded, in one
    /// transaction. Idempotent under re-runs.
    async fn complete(&self, job_id: JobId, rows: &[ResultRow]) -> Result<(), StoreError>;

    /// Persist a retry-policy decision (reschedule or terminal failure),
    /// releasing the lock.
    async fn fail(&self, job_id: JobId, decision: &RetryDecision) -> Result<(), StoreError>;

    /// Lock-free read of the job row.
    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Result rows ordered case-insensitively by event type, or `None`
    /// when the job does not exist. Not-yet-succeeded jobs read as empty.
    async fn get_results(&self, job_id: JobId) -> Result<Option<Vec<ResultRow>>, StoreError>;

    /// Trivial connectivity probe for readiness checks.
    async fn ping(&self) -> Result<(), StoreError>;
}
