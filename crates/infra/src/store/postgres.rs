//! Postgres-backed job store.
//!
//! Hand-rolled SQL over three tables. The claim protocol leans on
//! `FOR UPDATE SKIP LOCKED` so competing workers never block each other
//! and never see the same row.
//!
//! ## Error mapping
//!
//! SQLSTATE codes classify into the engine's taxonomy:
//!
//! | Code | Meaning | StoreError |
//! |------|---------|------------|
//! | `23505` | unique violation | `Conflict` |
//! | `40001`, `40P01` | serialization failure / deadlock | `Transient` |
//! | `08xxx`, `53xxx` | connection / resource exhaustion | `Transient` |
//! | `42xxx` | schema (undefined table, syntax, privilege) | `Fatal` |
//! | `28xxx`, `3D000` | authentication / unknown database | `Fatal` |
//!
//! Pool-level failures (timeout, closed) are `Transient`; anything else
//! unclassified is treated as `Transient` so a flaky network never
//! takes a worker down.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use tallyd_core::{
    JobId, JobRecord, JobStatus, NewSubmission, RawEvent, ResultRow, RetryDecision, TenantId,
};

use super::{ClaimedJob, JobStore, StoreError, SubmitOutcome};

/// Production job store over a sqlx connection pool.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
    stale_lock_timeout: Duration,
}

impl PgJobStore {
    pub fn new(pool: PgPool, stale_lock_timeout: Duration) -> Self {
        Self {
            pool,
            stale_lock_timeout,
        }
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &str,
        key: &str,
    ) -> Result<Option<JobId>, StoreError> {
        let id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM ingestion_jobs WHERE tenant_id = $1 AND idempotency_key = $2",
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        Ok(id.map(JobId::from_uuid))
    }
}

#[async_trait::async_trait]
impl JobStore for PgJobStore {
    #[instrument(
        skip(self, submission),
        fields(
            tenant_id = %submission.tenant_id,
            event_count = submission.events.len(),
            has_key = submission.idempotency_key.is_some()
        ),
        err
    )]
    async fn submit(&self, submission: &NewSubmission) -> Result<SubmitOutcome, StoreError> {
        // Fast path: an identical key already produced a job.
        if let Some(key) = submission.idempotency_key.as_deref() {
            if let Some(job_id) = self
                .find_by_idempotency_key(submission.tenant_id.as_str(), key)
                .await?
            {
                return Ok(SubmitOutcome {
                    job_id,
                    duplicate: true,
                });
            }
        }

        let now = Utc::now();
        let job_id = JobId::new();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ingestion_jobs (
                id, tenant_id, idempotency_key, status, attempt,
                created_at, updated_at, available_at
            )
            VALUES ($1, $2, $3, 'pending', 0, $4, $4, $4)
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(submission.tenant_id.as_str())
        .bind(submission.idempotency_key.as_deref())
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            // Lost a race with a concurrent submission for the same key:
            // the sibling row wins, return its id.
            if is_unique_violation(&e) {
                drop(tx);
                if let Some(key) = submission.idempotency_key.as_deref() {
                    if let Some(existing) = self
                        .find_by_idempotency_key(submission.tenant_id.as_str(), key)
                        .await?
                    {
                        return Ok(SubmitOutcome {
                            job_id: existing,
                            duplicate: true,
                        });
                    }
                }
            }
            return Err(map_sqlx_error("insert_job", e));
        }

        for event in &submission.events {
            sqlx::query(
                r#"
                INSERT INTO raw_events (job_id, tenant_id, event_type, occurred_at, payload)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(job_id.as_uuid())
            .bind(submission.tenant_id.as_str())
            .bind(&event.event_type)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_event", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_submit", e))?;

        Ok(SubmitOutcome {
            job_id,
            duplicate: false,
        })
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedJob>, StoreError> {
        let now = Utc::now();
        let stale_secs = self.stale_lock_timeout.as_secs_f64();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // One eligible job, FIFO by creation time, skipping rows other
        // transactions hold write locks on.
        let candidate: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM ingestion_jobs
            WHERE status IN ('pending', 'processing')
              AND (available_at IS NULL OR available_at <= $1)
              AND (locked_at IS NULL OR locked_at < $1 - make_interval(secs => $2))
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(stale_secs)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_eligible", e))?;

        let Some(id) = candidate else {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_empty_claim", e))?;
            return Ok(None);
        };

        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, idempotency_key, status, attempt, error,
                   created_at, updated_at, available_at, locked_at, locked_by, processed_at
            FROM ingestion_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("load_claimed_job", e))?;

        let mut job = JobRow::from_row(&row)
            .map_err(|e| StoreError::Fatal(format!("failed to decode job row: {e}")))?
            .into_record()?;

        // The row could have changed between selection and load only via
        // an administrative update racing this transaction; treat the
        // iteration as "no work" rather than fight over it.
        let stale = chrono::Duration::from_std(self.stale_lock_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36500));
        if !job.is_eligible(now, stale) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback_claim", e))?;
            return Ok(None);
        }

        let event_rows = sqlx::query(
            r#"
            SELECT id, job_id, tenant_id, event_type, occurred_at, payload
            FROM raw_events
            WHERE job_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("load_claimed_events", e))?;

        let mut events = Vec::with_capacity(event_rows.len());
        for row in event_rows {
            let event = EventRow::from_row(&row)
                .map_err(|e| StoreError::Fatal(format!("failed to decode event row: {e}")))?
                .into_event()?;
            events.push(event);
        }

        sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'processing',
                attempt = attempt + 1,
                locked_at = $2,
                locked_by = $3,
                updated_at = GREATEST(updated_at, $2)
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_processing", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_claim", e))?;

        job.mark_claimed(worker_id, now);
        Ok(Some(ClaimedJob { job, events }))
    }

    #[instrument(skip(self, rows), fields(job_id = %job_id, result_rows = rows.len()), err)]
    async fn complete(&self, job_id: JobId, rows: &[ResultRow]) -> Result<(), StoreError> {
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        // Full replacement: the result set is wholly determined by the
        // event set, so delete-then-insert keeps re-runs idempotent.
        sqlx::query("DELETE FROM ingestion_results WHERE job_id = $1")
            .bind(job_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_results", e))?;

        for row in rows {
            sqlx::query(
                "INSERT INTO ingestion_results (job_id, event_type, event_count) VALUES ($1, $2, $3)",
            )
            .bind(job_id.as_uuid())
            .bind(&row.event_type)
            .bind(row.count)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_result", e))?;
        }

        let updated = sqlx::query(
            r#"
            UPDATE ingestion_jobs
            SET status = 'succeeded',
                processed_at = $2,
                error = NULL,
                available_at = NULL,
                locked_at = NULL,
                locked_by = NULL,
                updated_at = GREATEST(updated_at, $2)
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_succeeded", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback_complete", e))?;
            return Err(StoreError::NotFound(job_id));
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_complete", e))
    }

    #[instrument(skip(self, decision), fields(job_id = %job_id), err)]
    async fn fail(&self, job_id: JobId, decision: &RetryDecision) -> Result<(), StoreError> {
        let now = Utc::now();

        let updated = match decision {
            RetryDecision::Retry { delay, error } => {
                let available_at = now + chrono::Duration::from_std(*delay).unwrap_or_default();
                sqlx::query(
                    r#"
                    UPDATE ingestion_jobs
                    SET status = 'pending',
                        error = $2,
                        available_at = $3,
                        locked_at = NULL,
                        locked_by = NULL,
                        updated_at = GREATEST(updated_at, $4)
                    WHERE id = $1
                    "#,
                )
                .bind(job_id.as_uuid())
                .bind(error)
                .bind(available_at)
                .bind(now)
                .execute(&self.pool)
                .await
            }
            RetryDecision::GiveUp { error } => {
                sqlx::query(
                    r#"
                    UPDATE ingestion_jobs
                    SET status = 'failed',
                        error = $2,
                        available_at = NULL,
                        locked_at = NULL,
                        locked_by = NULL,
                        updated_at = GREATEST(updated_at, $3)
                    WHERE id = $1
                    "#,
                )
                .bind(job_id.as_uuid())
                .bind(error)
                .bind(now)
                .execute(&self.pool)
                .await
            }
        }
        .map_err(|e| map_sqlx_error("persist_retry_decision", e))?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, tenant_id, idempotency_key, status, attempt, error,
                   created_at, updated_at, available_at, locked_at, locked_by, processed_at
            FROM ingestion_jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        match row {
            None => Ok(None),
            Some(row) => {
                let record = JobRow::from_row(&row)
                    .map_err(|e| StoreError::Fatal(format!("failed to decode job row: {e}")))?
                    .into_record()?;
                Ok(Some(record))
            }
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_results(&self, job_id: JobId) -> Result<Option<Vec<ResultRow>>, StoreError> {
        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM ingestion_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_exists", e))?;

        if exists.is_none() {
            return Ok(None);
        }

        let rows = sqlx::query(
            r#"
            SELECT event_type, event_count
            FROM ingestion_results
            WHERE job_id = $1
            ORDER BY lower(event_type) ASC, id ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_results", e))?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            results.push(ResultRow {
                event_type: row
                    .try_get("event_type")
                    .map_err(|e| StoreError::Fatal(format!("failed to decode result row: {e}")))?,
                count: row
                    .try_get("event_count")
                    .map_err(|e| StoreError::Fatal(format!("failed to decode result row: {e}")))?,
            });
        }
        Ok(Some(results))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| map_sqlx_error("ping", e))
    }
}

// SQLx row decoding

#[derive(Debug)]
struct JobRow {
    id: Uuid,
    tenant_id: String,
    idempotency_key: Option<String>,
    status: String,
    attempt: i32,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    available_at: Option<DateTime<Utc>>,
    locked_at: Option<DateTime<Utc>>,
    locked_by: Option<String>,
    processed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status: row.try_get("status")?,
            attempt: row.try_get("attempt")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            available_at: row.try_get("available_at")?,
            locked_at: row.try_get("locked_at")?,
            locked_by: row.try_get("locked_by")?,
            processed_at: row.try_get("processed_at")?,
        })
    }
}

impl JobRow {
    fn into_record(self) -> Result<JobRecord, StoreError> {
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|e| StoreError::Fatal(format!("corrupt job row {}: {e}", self.id)))?;
        let tenant_id = TenantId::new(self.tenant_id)
            .map_err(|e| StoreError::Fatal(format!("corrupt job row {}: {e}", self.id)))?;

        Ok(JobRecord {
            id: JobId::from_uuid(self.id),
            tenant_id,
            idempotency_key: self.idempotency_key,
            status,
            attempt: self.attempt,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            available_at: self.available_at,
            locked_at: self.locked_at,
            locked_by: self.locked_by,
            processed_at: self.processed_at,
        })
    }
}

#[derive(Debug)]
struct EventRow {
    id: i64,
    job_id: Uuid,
    tenant_id: String,
    event_type: String,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            tenant_id: row.try_get("tenant_id")?,
            event_type: row.try_get("event_type")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl EventRow {
    fn into_event(self) -> Result<RawEvent, StoreError> {
        let tenant_id = TenantId::new(self.tenant_id)
            .map_err(|e| StoreError::Fatal(format!("corrupt event row {}: {e}", self.id)))?;
        Ok(RawEvent {
            id: self.id,
            job_id: JobId::from_uuid(self.job_id),
            tenant_id,
            event_type: self.event_type,
            occurred_at: self.occurred_at,
            payload: self.payload,
        })
    }
}

// Error classification

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("40001") | Some("40P01") => StoreError::Transient(msg),
                Some(code) if code.starts_with("08") || code.starts_with("53") => {
                    StoreError::Transient(msg)
                }
                Some(code) if code.starts_with("42") || code.starts_with("28") => {
                    StoreError::Fatal(msg)
                }
                Some("3D000") => StoreError::Fatal(msg),
                _ => StoreError::Transient(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Transient(format!("connection error in {operation}: {err}"))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Fatal(format!("unexpected missing row in {operation}"))
        }
        other => StoreError::Transient(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
