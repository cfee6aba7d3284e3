//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::error::ApiResult;
use crate::state::AppState;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    /// Rows currently in the content index.
    indexed: u64,
    feeds: usize,
}

/// `GET /health`
///
/// Fails with 500 when the index cannot be read.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let indexed = state.feeds.indexed_count()?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        indexed,
        feeds: state.config.feeds.len(),
    }))
}
