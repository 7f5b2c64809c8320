use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    api,
    api::refresh::RefreshLimiter,
    clients::HnClient,
    config::Config,
    events::Broker,
    extract::Extractor,
    observability::Telemetry,
    store::{Dao, TopList},
    worker::{Cleaner, Fetcher, Poller, PollerConfig},
};

/// Shared handle the HTTP layer threads through every handler.
#[derive(Clone)]
pub(crate) struct AppState {
    registry: Arc<ComponentRegistry>,
}

/// Everything the relay wires together at startup: config, telemetry, the
/// store, the upstream client, the fetch orchestration, and the event hub.
pub struct ComponentRegistry {
    config: Arc<Config>,
    telemetry: Telemetry,
    dao: Dao,
    client: Arc<HnClient>,
    fetcher: Arc<Fetcher>,
    broker: Arc<Broker>,
    top_list: Arc<TopList>,
    refresh_limiter: Arc<RefreshLimiter>,
    cancel: CancellationToken,
}

impl AppState {
    pub(crate) fn new(registry: ComponentRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub(crate) fn telemetry(&self) -> &Telemetry {
        &self.registry.telemetry
    }

    pub(crate) fn dao(&self) -> &Dao {
        &self.registry.dao
    }

    pub(crate) fn client(&self) -> Arc<HnClient> {
        Arc::clone(&self.registry.client)
    }

    pub(crate) fn fetcher(&self) -> Arc<Fetcher> {
        Arc::clone(&self.registry.fetcher)
    }

    pub(crate) fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.registry.broker)
    }

    pub(crate) fn top_list(&self) -> &TopList {
        &self.registry.top_list
    }

    pub(crate) fn refresh_limiter(&self) -> &RefreshLimiter {
        &self.registry.refresh_limiter
    }

    pub(crate) fn cancel(&self) -> &CancellationToken {
        &self.registry.cancel
    }
}

impl ComponentRegistry {
    /// Initialize configuration-driven dependencies and build the shared
    /// registry. The cancellation token is observed by every background
    /// task and by in-flight upstream permit waits.
    ///
    /// # Errors
    /// Fails when telemetry, the store, or an HTTP client cannot be built.
    pub async fn build(config: Config, cancel: CancellationToken) -> Result<Self> {
        let config = Arc::new(config);
        let telemetry = Telemetry::new().context("failed to initialize telemetry")?;
        let dao = Dao::open(config.db_path(), config.db_max_connections()).await?;
        let client = Arc::new(HnClient::new(
            config.hn_base_url(),
            config.hn_request_timeout(),
            config.hn_max_concurrency().get(),
            cancel.clone(),
        )?);
        let extractor = Extractor::new(config.extract_timeout(), config.extract_max_bytes())?;
        let fetcher = Arc::new(Fetcher::new(
            Arc::clone(&client),
            dao.clone(),
            extractor,
            cancel.clone(),
        ));
        let broker = Arc::new(Broker::new(config.event_ring_capacity()));
        let top_list = Arc::new(TopList::new());
        let refresh_limiter = Arc::new(RefreshLimiter::new());

        Ok(Self {
            config,
            telemetry,
            dao,
            client,
            fetcher,
            broker,
            top_list,
            refresh_limiter,
            cancel,
        })
    }

    /// Start the poller and cleaner as long-lived background tasks.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        let poller = Poller::new(
            Arc::clone(&self.client),
            Arc::clone(&self.fetcher),
            self.dao.clone(),
            Arc::clone(&self.broker),
            Arc::clone(&self.top_list),
            self.telemetry.metrics(),
            PollerConfig {
                interval: self.config.poll_interval(),
                eager_count: self.config.poll_eager_count(),
                min_rank_pairs: self.config.poll_min_rank_pairs(),
            },
            self.cancel.clone(),
        );
        let cleaner = Cleaner::new(
            self.dao.clone(),
            self.telemetry.metrics(),
            self.cancel.clone(),
        );

        vec![poller.spawn(), cleaner.spawn()]
    }

    #[must_use]
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }
}

pub fn build_router(registry: ComponentRegistry) -> Router {
    let state = AppState::new(registry);
    api::router(state)
}
