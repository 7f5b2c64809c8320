use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode, Url};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

const USER_AGENT: &str = "HNRelay/1.0";
const EXCERPT_CHARS: usize = 200;

/// Tags that make up the readable body of a content container.
const BLOCK_TAGS: [&str; 9] = [
    "p",
    "h1",
    "h2",
    "h3",
    "ul",
    "ol",
    "pre",
    "blockquote",
    "figure",
];

/// Containers tried in order when picking the main content element.
const CANDIDATE_SELECTORS: [&str; 5] = ["article", "main", "[role=main]", "#content", "body"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid article url: {0}")]
    Url(#[from] url::ParseError),
    #[error("article fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("article fetch returned status {0}")]
    Status(StatusCode),
    #[error("response exceeds {0} bytes")]
    TooLarge(usize),
    #[error("document could not be parsed")]
    Parse,
    #[error("no readable content found")]
    Unreadable,
}

/// Reader-mode content derived from a page.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub title: String,
    pub byline: String,
    pub content: String,
    pub excerpt: String,
}

/// Fetches a story URL (size- and time-bounded) and derives readable text.
#[derive(Debug, Clone)]
pub struct Extractor {
    http: Client,
    max_bytes: usize,
}

impl Extractor {
    /// # Errors
    /// Fails when the dedicated HTTP client cannot be built.
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build article HTTP client")?;
        Ok(Self { http, max_bytes })
    }

    /// Fetch `raw_url` and extract reader-mode content.
    ///
    /// The body is read in chunks and abandoned as soon as it crosses the
    /// size ceiling, so a hostile page cannot buffer unbounded bytes.
    pub async fn extract(&self, raw_url: &str) -> Result<Extracted, ExtractError> {
        let url = Url::parse(raw_url)?;
        let mut response = self.http.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(ExtractError::Status(response.status()));
        }
        if let Some(length) = response.content_length() {
            if length as usize > self.max_bytes {
                return Err(ExtractError::TooLarge(self.max_bytes));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(ExtractError::TooLarge(self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        readable(&String::from_utf8_lossy(&body))
    }
}

/// Derive title, byline, content, and excerpt from an HTML document.
fn readable(html: &str) -> Result<Extracted, ExtractError> {
    let document = Html::parse_document(html);

    let container = best_container(&document)?;
    let content = block_html(container);
    if content.is_empty() {
        return Err(ExtractError::Unreadable);
    }

    let title = meta_content(&document, "meta[property=\"og:title\"]")
        .or_else(|| first_text(&document, "title"))
        .unwrap_or_default();
    let byline = meta_content(&document, "meta[name=\"author\"]")
        .or_else(|| meta_content(&document, "meta[property=\"article:author\"]"))
        .unwrap_or_default();
    let excerpt = meta_content(&document, "meta[property=\"og:description\"]")
        .or_else(|| meta_content(&document, "meta[name=\"description\"]"))
        .unwrap_or_else(|| leading_text(container));

    Ok(Extracted {
        title,
        byline,
        content,
        excerpt,
    })
}

/// Pick the candidate container with the largest paragraph text mass.
fn best_container(document: &Html) -> Result<ElementRef<'_>, ExtractError> {
    let paragraph = Selector::parse("p").map_err(|_| ExtractError::Parse)?;

    let mut best: Option<(usize, ElementRef<'_>)> = None;
    for raw in CANDIDATE_SELECTORS {
        let selector = Selector::parse(raw).map_err(|_| ExtractError::Parse)?;
        for element in document.select(&selector) {
            let mass: usize = element
                .select(&paragraph)
                .map(|p| p.text().map(str::len).sum::<usize>())
                .sum();
            if best.is_none_or(|(current, _)| mass > current) {
                best = Some((mass, element));
            }
        }
    }

    best.map(|(_, element)| element).ok_or(ExtractError::Unreadable)
}

/// Reassemble the container's readable blocks in document order, leaving
/// scripts, navigation, and other chrome behind. A block nested inside
/// another block (a paragraph in a blockquote, say) is covered by its
/// ancestor and not emitted twice.
fn block_html(container: ElementRef<'_>) -> String {
    let mut blocks = Vec::new();
    for node in container.descendants() {
        let Some(element) = ElementRef::wrap(node) else {
            continue;
        };
        if !BLOCK_TAGS.contains(&element.value().name()) {
            continue;
        }
        let nested = node
            .ancestors()
            .take_while(|a| a.id() != container.id())
            .any(|a| ElementRef::wrap(a).is_some_and(|e| BLOCK_TAGS.contains(&e.value().name())));
        if nested {
            continue;
        }
        if element.text().any(|t| !t.trim().is_empty()) {
            blocks.push(element.html());
        }
    }
    blocks.join("\n")
}

fn meta_content(document: &Html, raw: &str) -> Option<String> {
    let selector = Selector::parse(raw).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|e| e.value().attr("content"))
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

fn first_text(document: &Html, raw: &str) -> Option<String> {
    let selector = Selector::parse(raw).ok()?;
    document
        .select(&selector)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// First paragraph's text, truncated on a character boundary.
fn leading_text(container: ElementRef<'_>) -> String {
    let Ok(selector) = Selector::parse("p") else {
        return String::new();
    };
    let text = container
        .select(&selector)
        .map(|p| p.text().collect::<String>())
        .find(|t| !t.trim().is_empty())
        .unwrap_or_default();
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}
