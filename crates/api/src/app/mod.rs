//! HTTP application wiring (Axum router).
//!
//! Layout:
//! - `routes/`: handlers, one file per area
//! - `dto.rs`: request/response DTOs and JSON mapping
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};

use tallyd_infra::JobStore;

pub mod dto;
pub mod errors;
pub mod routes;

/// Build the full HTTP router over the given store (public entrypoint
/// used by `main.rs` and the black-box tests).
pub fn build_app(store: Arc<dyn JobStore>) -> Router {
    routes::router().layer(Extension(store))
}
