use std::sync::Arc;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Counters exposed at `/metrics`.
pub struct Metrics {
    pub polls_total: IntCounter,
    pub poll_failures_total: IntCounter,
    pub stories_fetched_total: IntCounter,
    pub events_published_total: IntCounter,
    pub cleanup_deleted_total: IntCounter,
}

impl Metrics {
    fn new(registry: &Registry) -> Result<Self> {
        let polls_total = counter(registry, "hn_relay_polls_total", "Completed poll cycles")?;
        let poll_failures_total = counter(
            registry,
            "hn_relay_poll_failures_total",
            "Poll cycles aborted on upstream failure",
        )?;
        let stories_fetched_total = counter(
            registry,
            "hn_relay_stories_fetched_total",
            "Stories fetched and upserted by the poller",
        )?;
        let events_published_total = counter(
            registry,
            "hn_relay_events_published_total",
            "Events published to the broker",
        )?;
        let cleanup_deleted_total = counter(
            registry,
            "hn_relay_cleanup_deleted_total",
            "Stale stories removed by the cleaner",
        )?;

        Ok(Self {
            polls_total,
            poll_failures_total,
            stories_fetched_total,
            events_published_total,
            cleanup_deleted_total,
        })
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help).context("failed to build counter")?;
    registry
        .register(Box::new(counter.clone()))
        .context("failed to register counter")?;
    Ok(counter)
}

/// Tracing initialization plus the process metrics registry.
#[derive(Clone)]
pub struct Telemetry {
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Telemetry {
    /// Initialize tracing (once per process) and build the registry.
    ///
    /// # Errors
    /// Fails when a metric cannot be registered.
    pub fn new() -> Result<Self> {
        init_tracing()?;
        let registry = Registry::new();
        let metrics = Metrics::new(&registry)?;
        Ok(Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        })
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Render the registry in the Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

fn init_tracing() -> Result<()> {
    TRACING_INIT.get_or_try_init(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_render_in_prometheus_format() {
        let telemetry = Telemetry::new().expect("telemetry builds");
        telemetry.metrics().polls_total.inc();
        telemetry.metrics().stories_fetched_total.inc_by(12);

        let rendered = telemetry.render_prometheus();
        assert!(rendered.contains("hn_relay_polls_total 1"));
        assert!(rendered.contains("hn_relay_stories_fetched_total 12"));
    }
}
