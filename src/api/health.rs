use axum::{extract::State, http::HeaderMap, http::StatusCode, response::Response};
use serde::Serialize;
use tracing::error;

use super::{error_response, json_with_etag};
use crate::app::AppState;

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    stories_count: i64,
    last_poll: i64,
}

/// GET /api/health: store reachability plus poll freshness.
pub(crate) async fn health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let stories_count = match state.dao().count_stories().await {
        Ok(count) => count,
        Err(e) => {
            error!(error = %format!("{e:#}"), "health check failed to count stories");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "store unavailable");
        }
    };
    let last_poll = state.dao().max_fetched_at().await.unwrap_or(0);

    json_with_etag(
        &headers,
        &HealthReport {
            status: "ok",
            stories_count,
            last_poll,
        },
    )
}
