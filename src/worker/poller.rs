use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Fetcher, Ranker};
use crate::clients::HnClient;
use crate::events::Broker;
use crate::observability::Metrics;
use crate::store::{Dao, RankPair, TopList};
use crate::util::time::now_unix;

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Prefix of the top list fetched with full depth (item + comments +
    /// article); the remainder is metadata-only.
    pub eager_count: usize,
    /// Below this many successful fetches the rank swap is skipped, so a
    /// mostly-failed poll cannot wipe the previous ordering.
    pub min_rank_pairs: usize,
}

/// The periodic control loop: refresh the top list, backfill stories, swap
/// ranks atomically, recompute period rankings, publish one change event.
pub struct Poller {
    client: Arc<HnClient>,
    fetcher: Arc<Fetcher>,
    dao: Dao,
    ranker: Ranker,
    broker: Arc<Broker>,
    top_list: Arc<TopList>,
    metrics: Arc<Metrics>,
    config: PollerConfig,
    cancel: CancellationToken,
}

impl Poller {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<HnClient>,
        fetcher: Arc<Fetcher>,
        dao: Dao,
        broker: Arc<Broker>,
        top_list: Arc<TopList>,
        metrics: Arc<Metrics>,
        config: PollerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let ranker = Ranker::new(dao.clone());
        Self {
            client,
            fetcher,
            dao,
            ranker,
            broker,
            top_list,
            metrics,
            config,
            cancel,
        }
    }

    /// Start the polling loop: one cycle immediately, then on the fixed
    /// interval until cancellation.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self) {
        // The first interval tick completes immediately.
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("poller: shutting down");
                    return;
                }
                _ = ticker.tick() => self.poll().await,
            }
        }
    }

    /// One full poll cycle. Failures abort the cycle, never the loop.
    pub async fn poll(&self) {
        info!("polling upstream top stories");
        let started = Instant::now();

        let top_ids = match self.client.top_stories().await {
            Ok(ids) => ids,
            Err(e) => {
                self.metrics.poll_failures_total.inc();
                error!(error = %e, "failed to fetch top stories");
                return;
            }
        };

        // Publish the new ordering before backfilling, so paginated reads
        // reflect it immediately; missing items fetch on demand.
        self.top_list.set(top_ids.clone());
        info!(count = top_ids.len(), "top list updated");

        let mut rank_pairs: Vec<RankPair> = Vec::new();
        let mut updated_ids: Vec<i64> = Vec::new();

        let eager = self.config.eager_count.min(top_ids.len());
        for (index, &id) in top_ids[..eager].iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("poller: cancelled during eager fetch");
                return;
            }
            if let Err(e) = self.fetcher.fetch_story_with_comments(id, None).await {
                error!(story_id = id, error = %format!("{e:#}"), "failed to fetch story");
                continue;
            }
            rank_pairs.push(RankPair {
                id,
                rank: index as i64 + 1,
            });
            updated_ids.push(id);
        }

        for (index, &id) in top_ids.iter().enumerate().skip(eager) {
            if self.cancel.is_cancelled() {
                info!("poller: cancelled during lazy fetch");
                break;
            }
            if let Err(e) = self.fetcher.fetch_story(id, None).await {
                error!(story_id = id, error = %format!("{e:#}"), "failed to fetch story metadata");
                continue;
            }
            rank_pairs.push(RankPair {
                id,
                rank: index as i64 + 1,
            });
            updated_ids.push(id);
        }

        if rank_pairs.len() >= self.config.min_rank_pairs {
            if let Err(e) = self.dao.swap_ranks(&rank_pairs).await {
                error!(error = %format!("{e:#}"), "failed to swap ranks");
            }
        } else {
            warn!(
                fetched = rank_pairs.len(),
                minimum = self.config.min_rank_pairs,
                "skipping rank swap: insufficient stories fetched"
            );
        }

        self.ranker.compute_all().await;

        self.metrics.polls_total.inc();
        self.metrics
            .stories_fetched_total
            .inc_by(updated_ids.len() as u64);
        info!(
            stories_updated = updated_ids.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "poll complete"
        );

        if !updated_ids.is_empty() {
            let payload = serde_json::json!({
                "story_ids": updated_ids,
                "timestamp": now_unix(),
            });
            self.broker.publish("stories_updated", payload.to_string());
            self.metrics.events_published_total.inc();
        }
    }
}
