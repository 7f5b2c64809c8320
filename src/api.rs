pub(crate) mod articles;
pub(crate) mod comments;
pub(crate) mod events;
pub(crate) mod health;
pub(crate) mod metrics;
pub(crate) mod refresh;
pub(crate) mod stories;

use axum::{
    Json, Router,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::app::AppState;

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stories", get(stories::list_stories))
        .route("/api/stories/top", get(stories::top_stories))
        .route("/api/stories/{id}", get(stories::get_story))
        .route("/api/stories/{id}/comments", get(comments::get_comments))
        .route("/api/stories/{id}/article", get(articles::get_article))
        .route(
            "/api/stories/{id}/refresh",
            get(refresh::refresh).post(refresh::refresh),
        )
        .route("/api/events", get(events::stream))
        .route("/api/health", get(health::health))
        .route("/metrics", get(metrics::exporter))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Serialize `value` with an md5 `ETag`, honoring `If-None-Match`.
pub(crate) fn json_with_etag(headers: &HeaderMap, value: &impl Serialize) -> Response {
    let Ok(body) = serde_json::to_vec(value) else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
    };

    let etag = format!("\"{:x}\"", md5::compute(&body));
    let matched = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == etag);
    if matched {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    (
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::ETAG, etag),
        ],
        body,
    )
        .into_response()
}
