use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One item from the upstream API. The API leaves absent fields out of the
/// JSON entirely, so every field defaults to its zero value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct HnItem {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub by: String,
    pub time: i64,
    pub text: String,
    pub url: String,
    pub title: String,
    pub score: i64,
    pub descendants: i64,
    pub kids: Vec<i64>,
    pub parent: i64,
    pub dead: bool,
    pub deleted: bool,
}

#[derive(Debug, Error)]
pub enum HnError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(StatusCode),
    #[error("invalid upstream url: {0}")]
    Url(#[from] url::ParseError),
}

/// Client for the upstream content API.
///
/// A single semaphore caps concurrent outbound requests across every
/// operation, so a burst (e.g. walking 500 comment branches) never exceeds
/// the ceiling. Permit acquisition races the shared cancellation token.
/// Failures are per-call; this client does not retry.
#[derive(Debug)]
pub struct HnClient {
    http: Client,
    base_url: Url,
    permits: Semaphore,
    cancel: CancellationToken,
}

impl HnClient {
    /// Build a client against `base_url` (a trailing slash is added when
    /// missing so relative joins resolve under it).
    ///
    /// # Errors
    /// Fails when the base URL does not parse or the HTTP client cannot be
    /// built.
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build upstream HTTP client")?;

        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("invalid upstream base URL")?;

        Ok(Self {
            http,
            base_url,
            permits: Semaphore::new(max_concurrency),
            cancel,
        })
    }

    async fn acquire(&self) -> Result<SemaphorePermit<'_>, HnError> {
        if self.cancel.is_cancelled() {
            return Err(HnError::Cancelled);
        }
        tokio::select! {
            permit = self.permits.acquire() => permit.map_err(|_| HnError::Cancelled),
            () = self.cancel.cancelled() => Err(HnError::Cancelled),
        }
    }

    /// The current front-page ordering, up to 500 ids.
    pub async fn top_stories(&self) -> Result<Vec<i64>, HnError> {
        let _permit = self.acquire().await?;
        let url = self.base_url.join("topstories.json")?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(HnError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    /// Fetch a single item. The upstream returns a literal `null` body for
    /// unknown ids, which maps to `None`.
    pub async fn item(&self, id: i64) -> Result<Option<HnItem>, HnError> {
        let _permit = self.acquire().await?;
        let url = self.base_url.join(&format!("item/{id}.json"))?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(HnError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    /// Best-effort batch fetch, positionally aligned with `ids`. Individual
    /// failures become `None` and never fail the batch; the semaphore still
    /// bounds how many requests are in flight at once.
    pub async fn items(&self, ids: &[i64]) -> Vec<Option<HnItem>> {
        let fetches = ids.iter().map(|&id| async move {
            match self.item(id).await {
                Ok(item) => item,
                Err(error) => {
                    debug!(item_id = id, error = %error, "batch item fetch failed");
                    None
                }
            }
        });
        futures::future::join_all(fetches).await
    }
}
