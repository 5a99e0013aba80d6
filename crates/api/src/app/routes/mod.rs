use axum::{
    Router,
    routing::{get, post},
};

pub mod jobs;
pub mod system;
pub mod transactions;

/// Router for all authenticated endpoints (mounted under `/api`).
pub fn router() -> Router {
    Router::new()
        .route("/jobs", post(jobs::submit_job).get(jobs::job_stats))
        .route("/jobs/:job_id", get(jobs::get_job))
        .route("/evaluate", post(transactions::evaluate))
        .route("/transactions/:tx_id", get(transactions::transaction_status))
}
