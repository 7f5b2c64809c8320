use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::{error_response, json_with_etag};
use crate::app::AppState;
use crate::store::{PAGE_SIZE, Period, Story};

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    page: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TopQuery {
    period: Option<String>,
    page: Option<i64>,
}

#[derive(Debug, Serialize)]
struct StoriesResponse {
    stories: Vec<Story>,
    page: i64,
    total: i64,
    complete: bool,
}

#[derive(Debug, Serialize)]
struct PeriodResponse {
    stories: Vec<Story>,
    page: i64,
    total: i64,
    period: &'static str,
}

/// GET /api/stories?page=N: the current front page in top-list order.
pub(crate) async fn list_stories(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Response {
    let page = query.page.filter(|p| *p > 0).unwrap_or(1);

    let (page_ids, total) = state
        .top_list()
        .page(page as usize, PAGE_SIZE as usize);
    if total > 0 {
        return serve_from_top_list(&state, &headers, page, &page_ids, total as i64).await;
    }

    // The top list is empty until the first poll after a restart; fall back
    // to the persisted rank ordering.
    let total = match state.dao().count_ranked().await {
        Ok(total) => total,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to count ranked stories");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let stories = match state.dao().list_by_rank(page).await {
        Ok((stories, _)) => stories,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to list ranked stories");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    json_with_etag(
        &headers,
        &StoriesResponse {
            stories,
            page,
            total,
            complete: true,
        },
    )
}

/// Load the page's stories from the store, backfilling missing ones on
/// demand through the singleflight fetch path.
async fn serve_from_top_list(
    state: &AppState,
    headers: &HeaderMap,
    page: i64,
    page_ids: &[i64],
    total: i64,
) -> Response {
    let mut found = match state.dao().stories_by_ids(page_ids).await {
        Ok(found) => found,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to batch-load stories");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    for &id in page_ids {
        if found.contains_key(&id) {
            continue;
        }
        if let Err(e) = state.fetcher().fetch_story_singleflight(id).await {
            error!(story_id = id, error = %format!("{e:#}"), "on-demand fetch failed");
            continue;
        }
        if let Ok(Some(story)) = state.dao().story_by_id(id).await {
            found.insert(id, story);
        }
    }

    // Positions in the current top list override any stored rank.
    let mut stories = Vec::with_capacity(page_ids.len());
    for (index, id) in page_ids.iter().enumerate() {
        if let Some(mut story) = found.remove(id) {
            story.rank = Some((page - 1) * PAGE_SIZE + index as i64 + 1);
            stories.push(story);
        }
    }

    json_with_etag(
        headers,
        &StoriesResponse {
            stories,
            page,
            total,
            complete: true,
        },
    )
}

/// GET /api/stories/{id}: a single story, fetched on demand when absent.
pub(crate) async fn get_story(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let story = match state.dao().story_by_id(id).await {
        Ok(story) => story,
        Err(e) => {
            error!(story_id = id, error = %format!("{e:#}"), "failed to load story");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    let story = match story {
        Some(story) => Some(story),
        None => {
            if let Err(e) = state.fetcher().fetch_story_singleflight(id).await {
                error!(story_id = id, error = %format!("{e:#}"), "on-demand fetch failed");
                return error_response(StatusCode::NOT_FOUND, "not found");
            }
            match state.dao().story_by_id(id).await {
                Ok(story) => story,
                Err(e) => {
                    error!(story_id = id, error = %format!("{e:#}"), "failed to reload story");
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
                }
            }
        }
    };

    match story {
        Some(story) => json_with_etag(&headers, &story),
        None => error_response(StatusCode::NOT_FOUND, "not found"),
    }
}

/// GET /api/stories/top?period=day|yesterday|week&page=N: period rankings.
pub(crate) async fn top_stories(
    State(state): State<AppState>,
    Query(query): Query<TopQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(period) = query.period.as_deref().and_then(Period::parse) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid period: must be day, yesterday, or week",
        );
    };
    let page = query.page.filter(|p| *p > 0).unwrap_or(1);

    match state.dao().stories_by_period(period, page).await {
        Ok((stories, total)) => json_with_etag(
            &headers,
            &PeriodResponse {
                stories,
                page,
                total,
                period: period.as_str(),
            },
        ),
        Err(e) => {
            error!(period = period.as_str(), error = %format!("{e:#}"), "failed to list period stories");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}
