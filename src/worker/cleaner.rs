use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::observability::Metrics;
use crate::store::Dao;
use crate::util::time::now_unix;

/// Delay before the first sweep, so a cold store is not swept at startup.
const INITIAL_DELAY: Duration = Duration::from_secs(60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_AGE_SECS: i64 = 30 * 24 * 60 * 60;

/// Periodic sweep removing stale, unranked, unreferenced stories.
pub struct Cleaner {
    dao: Dao,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
}

impl Cleaner {
    #[must_use]
    pub fn new(dao: Dao, metrics: Arc<Metrics>, cancel: CancellationToken) -> Self {
        Self {
            dao,
            metrics,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        tokio::select! {
            () = self.cancel.cancelled() => {
                info!("cleaner: shutting down before first sweep");
                return;
            }
            () = sleep(INITIAL_DELAY) => self.cleanup().await,
        }

        let start = tokio::time::Instant::now() + SWEEP_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, SWEEP_INTERVAL);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("cleaner: shutting down");
                    return;
                }
                _ = ticker.tick() => self.cleanup().await,
            }
        }
    }

    /// One sweep. Per-story failures are logged and skipped; cancellation is
    /// observed between deletions so shutdown is prompt.
    pub async fn cleanup(&self) {
        info!("cleaner: starting sweep");

        let cutoff = now_unix() - MAX_AGE_SECS;
        let ids = match self.dao.stale_story_ids(cutoff).await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %format!("{e:#}"), "cleaner: failed to find stale stories");
                return;
            }
        };

        let mut deleted: u64 = 0;
        for id in ids {
            if self.cancel.is_cancelled() {
                info!("cleaner: cancelled during sweep");
                break;
            }
            if let Err(e) = self.dao.delete_story(id).await {
                error!(story_id = id, error = %format!("{e:#}"), "cleaner: failed to delete story");
                continue;
            }
            deleted += 1;
        }

        if deleted > 0 {
            self.metrics.cleanup_deleted_total.inc_by(deleted);
            info!(count = deleted, "cleaner: deleted stale stories");
            if let Err(e) = self.dao.vacuum().await {
                error!(error = %format!("{e:#}"), "cleaner: vacuum failed");
            }
        }

        info!("cleaner: sweep complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::Telemetry;
    use crate::store::{Period, Ranking, Story};

    fn story(id: i64, fetched_at: i64, rank: Option<i64>) -> Story {
        Story {
            id,
            title: format!("story {id}"),
            url: None,
            text: None,
            score: 1,
            by: "tester".to_string(),
            time: fetched_at,
            descendants: 0,
            kind: "story".to_string(),
            fetched_at,
            rank,
            dead: false,
        }
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_unreferenced_stories() {
        let dao = Dao::open_in_memory().await.expect("store opens");
        let telemetry = Telemetry::new().expect("telemetry builds");

        // Ancient, unranked, unreferenced: swept.
        dao.upsert_story(&story(1, 10, None)).await.expect("stale");
        // Ancient but ranked: kept.
        dao.upsert_story(&story(2, 10, Some(1))).await.expect("ranked");
        // Ancient but referenced by a ranking period: kept.
        dao.upsert_story(&story(3, 10, None)).await.expect("referenced");
        dao.replace_rankings(
            Period::Week,
            &[Ranking {
                story_id: 3,
                period: Period::Week,
                score: 1.0,
                computed_at: 10,
            }],
        )
        .await
        .expect("ranking");
        // Fresh: kept.
        dao.upsert_story(&story(4, now_unix(), None))
            .await
            .expect("fresh");

        let cleaner = Cleaner::new(dao.clone(), telemetry.metrics(), CancellationToken::new());
        cleaner.cleanup().await;

        assert!(dao.story_by_id(1).await.unwrap().is_none());
        assert!(dao.story_by_id(2).await.unwrap().is_some());
        assert!(dao.story_by_id(3).await.unwrap().is_some());
        assert!(dao.story_by_id(4).await.unwrap().is_some());
        assert_eq!(telemetry.metrics().cleanup_deleted_total.get(), 1);
    }

    #[tokio::test]
    async fn cancelled_sweep_stops_deleting() {
        let dao = Dao::open_in_memory().await.expect("store opens");
        let telemetry = Telemetry::new().expect("telemetry builds");
        for id in 1..=5 {
            dao.upsert_story(&story(id, 10, None)).await.expect("stale");
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cleaner = Cleaner::new(dao.clone(), telemetry.metrics(), cancel);
        cleaner.cleanup().await;

        assert_eq!(dao.count_stories().await.expect("count"), 5);
    }
}
