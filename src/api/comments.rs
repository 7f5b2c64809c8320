use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
};
use serde::Serialize;
use tracing::error;

use super::{error_response, json_with_etag};
use crate::app::AppState;
use crate::store::CommentNode;

#[derive(Debug, Serialize)]
struct CommentsResponse {
    story_id: i64,
    fetched_at: i64,
    comments: Vec<CommentNode>,
}

/// GET /api/stories/{id}/comments: the stored comment tree, with an
/// on-demand backfill when the store is empty but the story reports
/// descendants.
pub(crate) async fn get_comments(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let (mut comments, mut fetched_at) = match state.dao().comment_tree(id).await {
        Ok(tree) => tree,
        Err(e) => {
            error!(story_id = id, error = %format!("{e:#}"), "failed to load comment tree");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };

    if comments.is_empty() {
        if let Some((tree, at)) = backfill(&state, id).await {
            comments = tree;
            fetched_at = at;
        }
    }

    json_with_etag(
        &headers,
        &CommentsResponse {
            story_id: id,
            fetched_at,
            comments,
        },
    )
}

async fn backfill(state: &AppState, id: i64) -> Option<(Vec<CommentNode>, i64)> {
    let story = state.dao().story_by_id(id).await.ok().flatten()?;
    if story.descendants == 0 {
        return None;
    }

    let item = state.client().item(id).await.ok().flatten()?;
    if item.kids.is_empty() {
        return None;
    }

    if let Err(e) = state
        .fetcher()
        .fetch_comments_singleflight(id, &item.kids)
        .await
    {
        error!(story_id = id, error = %format!("{e:#}"), "on-demand comment fetch failed");
        return None;
    }

    state.dao().comment_tree(id).await.ok()
}
