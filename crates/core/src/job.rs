//! The persisted job model and its lifecycle transitions.
//!
//! A job is one client submission tracked as a single row. Workers move
//! it through `Pending -> Processing -> {Succeeded, Failed}`; a failed
//! attempt with retries left goes back to `Pending` with a future
//! `available_at`. The store is the source of truth; the helpers here
//! exist so the in-memory store and the Postgres SQL express the same
//! transitions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{JobId, TenantId};
use crate::retry::RetryDecision;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed (includes jobs scheduled for retry).
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Aggregation committed.
    Succeeded,
    /// Retries exhausted.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DomainError::invalid_id(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ingestion job, mirroring the `ingestion_jobs` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub idempotency_key: Option<String>,
    pub status: JobStatus,
    /// Number of successful claims so far; only ever increases.
    pub attempt: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest wall-clock time the job may next be claimed.
    pub available_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Build a freshly submitted job: Pending, attempt 0, claimable now.
    pub fn new(tenant_id: TenantId, idempotency_key: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            idempotency_key,
            status: JobStatus::Pending,
            attempt: 0,
            error: None,
            created_at: now,
            updated_at: now,
            available_at: Some(now),
            locked_at: None,
            locked_by: None,
            processed_at: None,
        }
    }

    /// The claim-eligibility predicate.
    ///
    /// A job may be claimed when it is non-terminal, its `available_at`
    /// has passed, and any existing lock is stale. This is the same
    /// predicate the Postgres claim query expresses in SQL.
    pub fn is_eligible(&self, now: DateTime<Utc>, stale_lock_timeout: Duration) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if let Some(at) = self.available_at {
            if at > now {
                return false;
            }
        }
        match self.locked_at {
            None => true,
            Some(locked_at) => locked_at < now - stale_lock_timeout,
        }
    }

    /// Transition on a successful claim.
    pub fn mark_claimed(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.attempt += 1;
        self.locked_at = Some(now);
        self.locked_by = Some(worker_id.to_string());
        self.touch(now);
    }

    /// Terminal success transition; `processed_at` is set exactly once here.
    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Succeeded;
        self.processed_at = Some(now);
        self.error = None;
        self.available_at = None;
        self.locked_at = None;
        self.locked_by = None;
        self.touch(now);
    }

    /// Persist a retry-policy decision: reschedule or fail terminally.
    /// The lock is released either way.
    pub fn apply_retry(&mut self, decision: &RetryDecision, now: DateTime<Utc>) {
        match decision {
            RetryDecision::Retry { delay, error } => {
                self.status = JobStatus::Pending;
                self.error = Some(error.clone());
                self.available_at =
                    Some(now + Duration::from_std(*delay).unwrap_or_default());
            }
            RetryDecision::GiveUp { error } => {
                self.status = JobStatus::Failed;
                self.error = Some(error.clone());
                self.available_at = None;
            }
        }
        self.locked_at = None;
        self.locked_by = None;
        self.touch(now);
    }

    // updated_at is monotone within one job even if clocks wobble.
    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now.max(self.updated_at);
    }
}

/// One item inside a submission, preserved verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: i64,
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub event_type: String,
    /// Caller-supplied wall-clock time; never interpreted by the engine.
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// One (event type, count) pair produced by the aggregator for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    pub event_type: String,
    pub count: i64,
}
