//! Request/response DTOs and their mapping onto domain types.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use tallyd_core::{EventDraft, JobRecord, NewSubmission, ResultRow, ValidationErrors};

/// Body of `POST /v1/ingestions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub events: Vec<EventDto>,
}

#[derive(Debug, Deserialize)]
pub struct EventDto {
    #[serde(rename = "type", default)]
    pub event_type: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SubmitRequest {
    /// Validate into a domain submission; the error map is returned
    /// verbatim in the 400 body.
    pub fn into_submission(
        self,
        idempotency_key: Option<String>,
    ) -> Result<NewSubmission, ValidationErrors> {
        let events = self
            .events
            .into_iter()
            .map(|e| EventDraft {
                event_type: e.event_type,
                occurred_at: e.timestamp,
                payload: e.payload,
            })
            .collect();
        NewSubmission::build(&self.tenant_id, idempotency_key, events)
    }
}

pub fn job_to_json(job: &JobRecord) -> serde_json::Value {
    serde_json::json!({
        "jobId": job.id.to_string(),
        "status": job.status.as_str(),
        "attempt": job.attempt,
        "createdAt": job.created_at.to_rfc3339(),
        "updatedAt": job.updated_at.to_rfc3339(),
        "processedAt": job.processed_at.map(|t| t.to_rfc3339()),
        "availableAt": job.available_at.map(|t| t.to_rfc3339()),
        "error": job.error,
    })
}

pub fn results_to_json(job_id: &str, rows: &[ResultRow]) -> serde_json::Value {
    serde_json::json!({
        "jobId": job_id,
        "results": rows
            .iter()
            .map(|r| serde_json::json!({"eventType": r.event_type, "count": r.count}))
            .collect::<Vec<_>>(),
    })
}
