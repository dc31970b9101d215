//! Health probes.

use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode};

use tallyd_infra::JobStore;

/// GET /health/live: the process is up.
pub async fn live() -> StatusCode {
    StatusCode::OK
}

/// GET /health/ready: the store answers a trivial query.
pub async fn ready(Extension(store): Extension<Arc<dyn JobStore>>) -> StatusCode {
    match store.ping().await {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
