use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use tracing::{error, info};

use super::{error_response, json_with_etag};
use crate::app::AppState;
use crate::store::Story;

/// GET /api/stories/{id}/article: the cached extraction, produced on
/// demand the first time it is requested. A cached failure is served as-is;
/// an explicit refresh re-attempts it.
pub(crate) async fn get_article(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let Some(story) = load_story(&state, id).await else {
        return error_response(StatusCode::NOT_FOUND, "story not found");
    };
    let Some(url) = story.url.as_deref() else {
        return error_response(StatusCode::NOT_FOUND, "story has no URL");
    };

    let article = match state.dao().article_by_story(id).await {
        Ok(article) => article,
        Err(e) => {
            error!(story_id = id, error = %format!("{e:#}"), "failed to load article");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let article = match article {
        Some(article) => Some(article),
        None => {
            info!(story_id = id, "on-demand article extraction");
            state.fetcher().extract_article_singleflight(id, url).await;
            match state.dao().article_by_story(id).await {
                Ok(article) => article,
                Err(e) => {
                    error!(story_id = id, error = %format!("{e:#}"), "failed to reload article");
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
                }
            }
        }
    };

    match article {
        Some(article) => json_with_etag(&headers, &article),
        None => error_response(StatusCode::NOT_FOUND, "article not found"),
    }
}

async fn load_story(state: &AppState, id: i64) -> Option<Story> {
    match state.dao().story_by_id(id).await {
        Ok(Some(story)) => return Some(story),
        Ok(None) => {}
        Err(e) => {
            error!(story_id = id, error = %format!("{e:#}"), "failed to load story");
            return None;
        }
    }

    if let Err(e) = state.fetcher().fetch_story_singleflight(id).await {
        error!(story_id = id, error = %format!("{e:#}"), "on-demand story fetch failed");
        return None;
    }
    state.dao().story_by_id(id).await.ok().flatten()
}
