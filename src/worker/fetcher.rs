use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::Cancelled;
use crate::clients::{HnClient, HnItem};
use crate::extract::Extractor;
use crate::store::{Article, Comment, Dao, Story};
use crate::util::singleflight::{Group, Outcome};
use crate::util::time::now_unix;

/// Orchestrates fetching items, comment trees, and article extractions, and
/// writes everything through the store as idempotent upserts.
///
/// Three singleflight groups coalesce concurrent identical requests. Story
/// and story-with-comments flights share a group under distinct key prefixes
/// so they never collide; comment walks and article extractions get their
/// own groups keyed by story id.
pub struct Fetcher {
    client: Arc<HnClient>,
    dao: Dao,
    extractor: Extractor,
    cancel: CancellationToken,
    story_flights: Group<String>,
    comment_flights: Group<i64>,
    article_flights: Group<i64>,
}

impl Fetcher {
    #[must_use]
    pub fn new(
        client: Arc<HnClient>,
        dao: Dao,
        extractor: Extractor,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            dao,
            extractor,
            cancel,
            story_flights: Group::new(),
            comment_flights: Group::new(),
            article_flights: Group::new(),
        }
    }

    /// Fetch one story and upsert it. An absent upstream record is a no-op
    /// success, not an error.
    pub async fn fetch_story(&self, id: i64, rank: Option<i64>) -> Result<()> {
        let Some(item) = self.client.item(id).await? else {
            return Ok(());
        };
        if item.id == 0 {
            return Ok(());
        }

        let story = story_from_item(&item, now_unix(), rank);
        self.dao.upsert_story(&story).await
    }

    /// Fetch a story, its full comment tree, and (for newly seen stories
    /// with a URL) its article extraction.
    ///
    /// A failed comment walk or extraction is logged, not fatal: the story
    /// upsert has already landed and the rest backfills on demand.
    pub async fn fetch_story_with_comments(&self, id: i64, rank: Option<i64>) -> Result<()> {
        let Some(item) = self.client.item(id).await? else {
            return Ok(());
        };
        if item.id == 0 {
            return Ok(());
        }

        let now = now_unix();
        let newly_seen = self.dao.story_by_id(item.id).await?.is_none();

        let story = story_from_item(&item, now, rank);
        self.dao.upsert_story(&story).await?;

        if !item.kids.is_empty() {
            if let Err(e) = self.fetch_comments(item.id, &item.kids).await {
                warn!(story_id = item.id, error = %format!("{e:#}"), "comment walk failed");
            }
        }

        if newly_seen && !item.url.is_empty() {
            self.extract_article(item.id, &item.url).await;
        }

        Ok(())
    }

    /// Walk a story's comment branches with an explicit frontier queue
    /// (threads can nest arbitrarily deep, so no recursion): fetch one
    /// level as a batch, upsert each comment, queue its children.
    ///
    /// Cancellation is checked between upserts; a partial tree is safe
    /// because every node is an upsert and a later walk overwrites it.
    pub async fn fetch_comments(&self, story_id: i64, kids: &[i64]) -> Result<()> {
        let mut frontier: Vec<i64> = kids.to_vec();

        while !frontier.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }

            let level = std::mem::take(&mut frontier);
            let items = self.client.items(&level).await;
            let now = now_unix();

            for item in items.into_iter().flatten() {
                if self.cancel.is_cancelled() {
                    return Err(Cancelled.into());
                }

                let comment = Comment {
                    id: item.id,
                    story_id,
                    // A parent equal to the story itself means top-level.
                    parent_id: (item.parent != story_id).then_some(item.parent),
                    by: none_if_empty(&item.by),
                    text: none_if_empty(&item.text),
                    time: item.time,
                    dead: item.dead,
                    deleted: item.deleted,
                    fetched_at: now,
                };
                if let Err(e) = self.dao.upsert_comment(&comment).await {
                    error!(comment_id = item.id, error = %format!("{e:#}"), "failed to upsert comment");
                    continue;
                }

                frontier.extend(&item.kids);
            }
        }

        Ok(())
    }

    /// Run reader-mode extraction for a story URL and cache the outcome,
    /// including failure, so reads don't retrigger a known-bad extraction.
    pub async fn extract_article(&self, story_id: i64, url: &str) {
        let now = now_unix();
        let article = match self.extractor.extract(url).await {
            Ok(extracted) => Article {
                story_id,
                content: Some(extracted.content),
                title: Some(extracted.title),
                excerpt: Some(extracted.excerpt),
                byline: Some(extracted.byline),
                extraction_failed: false,
                fetched_at: now,
            },
            Err(e) => {
                warn!(story_id, error = %e, "article extraction failed");
                Article {
                    story_id,
                    content: None,
                    title: None,
                    excerpt: None,
                    byline: None,
                    extraction_failed: true,
                    fetched_at: now,
                }
            }
        };

        if let Err(e) = self.dao.upsert_article(&article).await {
            error!(story_id, error = %format!("{e:#}"), "failed to store article");
        }
    }

    // ── singleflight-guarded variants ────────────────────────────────
    //
    // Concurrent callers for the same key share one in-flight operation
    // and receive the same outcome.

    pub async fn fetch_story_singleflight(&self, id: i64) -> Result<()> {
        flatten(
            self.story_flights
                .run(format!("story-{id}"), || self.fetch_story(id, None))
                .await,
        )
    }

    pub async fn fetch_story_with_comments_singleflight(&self, id: i64) -> Result<()> {
        flatten(
            self.story_flights
                .run(format!("story-comments-{id}"), || {
                    self.fetch_story_with_comments(id, None)
                })
                .await,
        )
    }

    pub async fn fetch_comments_singleflight(&self, story_id: i64, kids: &[i64]) -> Result<()> {
        flatten(
            self.comment_flights
                .run(story_id, || self.fetch_comments(story_id, kids))
                .await,
        )
    }

    pub async fn extract_article_singleflight(&self, story_id: i64, url: &str) {
        let _ = self
            .article_flights
            .run(story_id, || async {
                self.extract_article(story_id, url).await;
                Ok(())
            })
            .await;
    }
}

fn flatten(outcome: Outcome) -> Result<()> {
    outcome.map_err(|shared| anyhow::anyhow!("{shared:#}"))
}

fn story_from_item(item: &HnItem, now: i64, rank: Option<i64>) -> Story {
    Story {
        id: item.id,
        title: item.title.clone(),
        url: none_if_empty(&item.url),
        text: none_if_empty(&item.text),
        score: item.score,
        by: if item.by.is_empty() {
            "[unknown]".to_string()
        } else {
            item.by.clone()
        },
        time: item.time,
        descendants: item.descendants,
        kind: if item.kind.is_empty() {
            "story".to_string()
        } else {
            item.kind.clone()
        },
        fetched_at: now,
        rank,
        dead: item.dead,
    }
}

fn none_if_empty(raw: &str) -> Option<String> {
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn fetcher_against(server: &MockServer) -> Fetcher {
        fetcher_with_token(server, CancellationToken::new()).await
    }

    async fn fetcher_with_token(server: &MockServer, cancel: CancellationToken) -> Fetcher {
        let client = Arc::new(
            HnClient::new(&server.uri(), Duration::from_secs(5), 4, cancel.clone())
                .expect("client builds"),
        );
        let dao = Dao::open_in_memory().await.expect("store opens");
        let extractor = Extractor::new(Duration::from_secs(5), 1 << 20).expect("extractor builds");
        Fetcher::new(client, dao, extractor, cancel)
    }

    fn mount_item(server: &MockServer, id: i64, body: serde_json::Value) -> Mock {
        Mock::given(method("GET"))
            .and(path(format!("/item/{id}.json")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
    }

    #[tokio::test]
    async fn fetch_story_upserts_the_record() {
        let server = MockServer::start().await;
        mount_item(
            &server,
            1,
            serde_json::json!({
                "id": 1, "type": "story", "title": "Show HN: a relay",
                "by": "alice", "time": 1700000000, "score": 12,
                "url": "https://example.com/relay", "descendants": 0
            }),
        )
        .mount(&server)
        .await;

        let fetcher = fetcher_against(&server).await;
        fetcher.fetch_story(1, Some(4)).await.expect("fetch");

        let story = fetcher
            .dao
            .story_by_id(1)
            .await
            .expect("load")
            .expect("present");
        assert_eq!(story.title, "Show HN: a relay");
        assert_eq!(story.rank, Some(4));
        assert_eq!(story.url.as_deref(), Some("https://example.com/relay"));
    }

    #[tokio::test]
    async fn absent_item_is_a_noop_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/item/9.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;

        let fetcher = fetcher_against(&server).await;
        fetcher.fetch_story(9, None).await.expect("noop fetch");
        assert!(fetcher.dao.story_by_id(9).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn comment_walk_covers_nested_levels() {
        let server = MockServer::start().await;
        mount_item(
            &server,
            1,
            serde_json::json!({
                "id": 1, "type": "story", "title": "threaded", "by": "alice",
                "time": 1700000000, "score": 5, "descendants": 3, "kids": [2, 3]
            }),
        )
        .mount(&server)
        .await;
        mount_item(
            &server,
            2,
            serde_json::json!({
                "id": 2, "type": "comment", "by": "bob", "parent": 1,
                "time": 1700000100, "text": "top level", "kids": [4]
            }),
        )
        .mount(&server)
        .await;
        mount_item(
            &server,
            3,
            serde_json::json!({
                "id": 3, "type": "comment", "by": "carol", "parent": 1,
                "time": 1700000200, "text": "also top level"
            }),
        )
        .mount(&server)
        .await;
        mount_item(
            &server,
            4,
            serde_json::json!({
                "id": 4, "type": "comment", "by": "dave", "parent": 2,
                "time": 1700000300, "text": "nested reply"
            }),
        )
        .mount(&server)
        .await;

        let fetcher = fetcher_against(&server).await;
        fetcher
            .fetch_story_with_comments(1, None)
            .await
            .expect("fetch");

        let (roots, _) = fetcher.dao.comment_tree(1).await.expect("tree");
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].id, 2);
        assert_eq!(roots[0].children.len(), 1);
        assert_eq!(roots[0].children[0].id, 4);
        assert_eq!(roots[1].id, 3);
    }

    #[tokio::test]
    async fn fetching_twice_leaves_the_same_state() {
        let server = MockServer::start().await;
        mount_item(
            &server,
            1,
            serde_json::json!({
                "id": 1, "type": "story", "title": "idempotent", "by": "alice",
                "time": 1700000000, "score": 7
            }),
        )
        .mount(&server)
        .await;

        let fetcher = fetcher_against(&server).await;
        fetcher.fetch_story(1, None).await.expect("first");
        fetcher.fetch_story(1, None).await.expect("second");

        assert_eq!(fetcher.dao.count_stories().await.expect("count"), 1);
        let story = fetcher.dao.story_by_id(1).await.unwrap().unwrap();
        assert_eq!(story.score, 7);
    }

    #[tokio::test]
    async fn concurrent_singleflight_calls_hit_upstream_once() {
        let server = MockServer::start().await;
        mount_item(
            &server,
            42,
            serde_json::json!({
                "id": 42, "type": "story", "title": "once", "by": "alice",
                "time": 1700000000, "score": 1
            }),
        )
        .expect(1)
        .mount(&server)
        .await;

        let fetcher = fetcher_against(&server).await;
        let (a, b) = tokio::join!(
            fetcher.fetch_story_singleflight(42),
            fetcher.fetch_story_singleflight(42),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        // The mock's expect(1) verifies exactly one upstream request on drop.
    }

    #[tokio::test]
    async fn new_story_with_url_triggers_extraction_once() {
        let article_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/post"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<html><head><title>T</title></head><body><article><p>Plenty of readable text here.</p></article></body></html>",
            ))
            .expect(1)
            .mount(&article_server)
            .await;

        let server = MockServer::start().await;
        mount_item(
            &server,
            1,
            serde_json::json!({
                "id": 1, "type": "story", "title": "linked", "by": "alice",
                "time": 1700000000, "score": 3,
                "url": format!("{}/post", article_server.uri())
            }),
        )
        .mount(&server)
        .await;

        let fetcher = fetcher_against(&server).await;
        fetcher
            .fetch_story_with_comments(1, None)
            .await
            .expect("first fetch");
        // Second fetch sees an existing story: no re-extraction.
        fetcher
            .fetch_story_with_comments(1, None)
            .await
            .expect("second fetch");

        let article = fetcher
            .dao
            .article_by_story(1)
            .await
            .expect("load")
            .expect("present");
        assert!(!article.extraction_failed);
        assert!(article.content.as_deref().unwrap().contains("readable text"));
    }

    #[tokio::test]
    async fn failed_extraction_is_cached() {
        let article_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&article_server)
            .await;

        let server = MockServer::start().await;
        let fetcher = fetcher_against(&server).await;
        fetcher
            .dao
            .upsert_story(&story_from_item(
                &HnItem {
                    id: 5,
                    kind: "story".to_string(),
                    title: "no article".to_string(),
                    by: "alice".to_string(),
                    time: 1_700_000_000,
                    ..HnItem::default()
                },
                1_700_000_000,
                None,
            ))
            .await
            .expect("seed story");
        fetcher
            .extract_article(5, &format!("{}/gone", article_server.uri()))
            .await;

        let article = fetcher
            .dao
            .article_by_story(5)
            .await
            .expect("load")
            .expect("present");
        assert!(article.extraction_failed);
        assert!(article.content.is_none());
    }

    #[tokio::test]
    async fn cancelled_walk_exits_early() {
        let server = MockServer::start().await;
        let cancel = CancellationToken::new();
        let fetcher = fetcher_with_token(&server, cancel.clone()).await;

        cancel.cancel();
        let result = fetcher.fetch_comments(1, &[2, 3]).await;
        let err = result.expect_err("cancelled walk fails");
        assert!(err.downcast_ref::<Cancelled>().is_some());
    }
}
