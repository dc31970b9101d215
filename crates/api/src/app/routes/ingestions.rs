//! Submission and status endpoints.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use tracing::info;

use tallyd_core::JobId;
use tallyd_infra::JobStore;

use crate::app::{dto, errors};

const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// POST /v1/ingestions
///
/// Accepts a batch of events for a tenant, records it as a job, and
/// returns 202 with the job id. Repeated submissions carrying the same
/// `Idempotency-Key` collapse onto the first job.
pub async fn submit(
    Extension(store): Extension<Arc<dyn JobStore>>,
    headers: HeaderMap,
    Json(body): Json<dto::SubmitRequest>,
) -> axum::response::Response {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let submission = match body.into_submission(idempotency_key) {
        Ok(submission) => submission,
        Err(errors) => return errors::validation_error_response(errors),
    };

    match store.submit(&submission).await {
        Ok(outcome) => {
            info!(
                job_id = %outcome.job_id,
                tenant_id = %submission.tenant_id,
                duplicate = outcome.duplicate,
                events = submission.events.len(),
                "submission accepted"
            );
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "jobId": outcome.job_id.to_string() })),
            )
                .into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /v1/ingestions/:job_id
///
/// Current status snapshot of a job, or 404.
pub async fn get_status(
    Extension(store): Extension<Arc<dyn JobStore>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let Ok(job_id) = job_id.parse::<JobId>() else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "no such job");
    };

    match store.get_job(job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(dto::job_to_json(&job))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "no such job"),
        Err(e) => errors::store_error_to_response(e),
    }
}
