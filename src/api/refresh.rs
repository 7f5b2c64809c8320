use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::error_response;
use crate::app::AppState;
use crate::events::Broker;
use crate::store::Dao;
use crate::util::time::now_unix;
use crate::worker::Fetcher;

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(30);
const RATE_LIMIT_CAPACITY: usize = 10_000;
const RATE_LIMIT_SWEEP_AGE: Duration = Duration::from_secs(60);

/// Per-story refresh rate limiting: one request per story per window, with
/// TTL eviction so the map stays bounded.
#[derive(Debug, Default)]
pub(crate) struct RefreshLimiter {
    last: Mutex<HashMap<i64, Instant>>,
}

impl RefreshLimiter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn allow(&self, id: i64) -> bool {
        let mut last = self.last.lock().expect("refresh limiter lock poisoned");
        let now = Instant::now();

        if last.len() > RATE_LIMIT_CAPACITY {
            last.retain(|_, at| now.duration_since(*at) <= RATE_LIMIT_SWEEP_AGE);
        }

        if let Some(at) = last.get(&id) {
            if now.duration_since(*at) < RATE_LIMIT_WINDOW {
                return false;
            }
        }
        last.insert(id, now);
        true
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshQuery {
    article: Option<String>,
}

#[derive(Debug, Serialize)]
struct Accepted {
    status: &'static str,
    story_id: i64,
}

/// GET|POST /api/stories/{id}/refresh: answer 202 immediately and refresh
/// story + comments (and optionally the article) in a detached task, then
/// announce the result over the event channel.
pub(crate) async fn refresh(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<RefreshQuery>,
) -> Response {
    if !state.refresh_limiter().allow(id) {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate limited — retry after 30s",
        );
    }

    let re_extract = query.article.as_deref() == Some("true");

    let fetcher = state.fetcher();
    let dao = state.dao().clone();
    let broker = state.broker();
    tokio::spawn(async move {
        do_refresh(&fetcher, &dao, &broker, id, re_extract).await;
    });

    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            status: "accepted",
            story_id: id,
        }),
    )
        .into_response()
}

async fn do_refresh(fetcher: &Fetcher, dao: &Dao, broker: &Broker, id: i64, re_extract: bool) {
    if let Err(e) = fetcher.fetch_story_with_comments(id, None).await {
        error!(story_id = id, error = %format!("{e:#}"), "refresh failed");
        return;
    }

    if re_extract {
        match dao.story_by_id(id).await {
            Ok(Some(story)) => {
                if let Some(url) = story.url.as_deref() {
                    fetcher.extract_article(id, url).await;
                }
            }
            _ => warn!(story_id = id, "cannot find story for article re-extraction"),
        }
    }

    let payload = serde_json::json!({
        "story_id": id,
        "timestamp": now_unix(),
    })
    .to_string();
    broker.publish("story_refreshed", payload.clone());
    broker.publish("comments_updated", payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_refresh_within_window_is_rejected() {
        let limiter = RefreshLimiter::new();
        assert!(limiter.allow(1));
        assert!(!limiter.allow(1));
        assert!(limiter.allow(2));
    }
}
