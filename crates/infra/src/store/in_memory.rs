//! In-memory job store for tests and local development.
//!
//! Honours the same contract as the Postgres store: each trait call is
//! atomic (one mutex hold), eligibility and FIFO follow the same
//! predicate, and the idempotency uniqueness is enforced.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

use tallyd_core::{JobId, JobRecord, NewSubmission, RawEvent, ResultRow, RetryDecision};

use super::{ClaimedJob, JobStore, StoreError, SubmitOutcome};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, JobRecord>,
    events: HashMap<JobId, Vec<RawEvent>>,
    results: HashMap<JobId, Vec<ResultRow>>,
    next_event_id: i64,
}

pub struct InMemoryJobStore {
    state: Mutex<State>,
    stale_lock_timeout: chrono::Duration,
}

impl InMemoryJobStore {
    pub fn new(stale_lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            stale_lock_timeout: chrono::Duration::from_std(stale_lock_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(36500)),
        }
    }

    /// Test fixture: age a job's lock as if its worker died `by` ago.
    pub async fn backdate_lock(&self, job_id: JobId, by: Duration) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            let by = chrono::Duration::from_std(by).unwrap_or_default();
            job.locked_at = job.locked_at.map(|at| at - by);
        }
    }

    /// Test fixture: current snapshot of every job, FIFO order.
    pub async fn all_jobs(&self) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.id.as_uuid().cmp(b.id.as_uuid()))
        });
        jobs
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn submit(&self, submission: &NewSubmission) -> Result<SubmitOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        if let Some(key) = submission.idempotency_key.as_deref() {
            if let Some(existing) = state.jobs.values().find(|j| {
                j.tenant_id == submission.tenant_id && j.idempotency_key.as_deref() == Some(key)
            }) {
                return Ok(SubmitOutcome {
                    job_id: existing.id,
                    duplicate: true,
                });
            }
        }

        let job = JobRecord::new(
            submission.tenant_id.clone(),
            submission.idempotency_key.clone(),
            now,
        );
        let job_id = job.id;

        let mut events = Vec::with_capacity(submission.events.len());
        for event in &submission.events {
            state.next_event_id += 1;
            events.push(RawEvent {
                id: state.next_event_id,
                job_id,
                tenant_id: submission.tenant_id.clone(),
                event_type: event.event_type.clone(),
                occurred_at: event.occurred_at,
                payload: event.payload.clone(),
            });
        }

        state.jobs.insert(job_id, job);
        state.events.insert(job_id, events);

        Ok(SubmitOutcome {
            job_id,
            duplicate: false,
        })
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let candidate = state
            .jobs
            .values()
            .filter(|j| j.is_eligible(now, self.stale_lock_timeout))
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then(a.id.as_uuid().cmp(b.id.as_uuid()))
            })
            .map(|j| j.id);

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.mark_claimed(worker_id, now);
        let job = job.clone();
        let events = state.events.get(&job_id).cloned().unwrap_or_default();

        Ok(Some(ClaimedJob { job, events }))
    }

    async fn complete(&self, job_id: JobId, rows: &[ResultRow]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        // Replacement semantics: whatever was there before is dropped.
        state.results.insert(job_id, rows.to_vec());
        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound(job_id))?;
        job.mark_succeeded(now);
        Ok(())
    }

    async fn fail(&self, job_id: JobId, decision: &RetryDecision) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound(job_id))?;
        job.apply_retry(decision, now);
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&job_id).cloned())
    }

    async fn get_results(&self, job_id: JobId) -> Result<Option<Vec<ResultRow>>, StoreError> {
        let state = self.state.lock().await;
        if !state.jobs.contains_key(&job_id) {
            return Ok(None);
        }
        let mut rows = state.results.get(&job_id).cloned().unwrap_or_default();
        rows.sort_by(|a, b| {
            a.event_type
                .to_ascii_lowercase()
                .cmp(&b.event_type.to_ascii_lowercase())
        });
        Ok(Some(rows))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
