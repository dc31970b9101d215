//! Aggregated result reads.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use tallyd_core::JobId;
use tallyd_infra::JobStore;

use crate::app::{dto, errors};

/// GET /v1/results/:job_id
///
/// Ordered (event type, count) rows for a job. 404 when the job is
/// unknown; an empty list while it has not yet succeeded.
pub async fn get_results(
    Extension(store): Extension<Arc<dyn JobStore>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let Ok(parsed) = job_id.parse::<JobId>() else {
        return errors::json_error(StatusCode::NOT_FOUND, "not_found", "no such job");
    };

    match store.get_results(parsed).await {
        Ok(Some(rows)) => {
            (StatusCode::OK, Json(dto::results_to_json(&job_id, &rows))).into_response()
        }
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "no such job"),
        Err(e) => errors::store_error_to_response(e),
    }
}
