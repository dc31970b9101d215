use axum::routing::{get, post};
use axum::Router;

pub mod ingestions;
pub mod results;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/v1/ingestions", post(ingestions::submit))
        .route("/v1/ingestions/:job_id", get(ingestions::get_status))
        .route("/v1/results/:job_id", get(results::get_results))
        .route("/health/live", get(system::live))
        .route("/health/ready", get(system::ready))
}
