//! Source adapter contracts plus the feed and listing-page adapters.

mod feed;
mod filter;
mod scrape;

use async_trait::async_trait;
use bugdaily_core::{Platform, Report, Severity};
use bugdaily_storage::HttpFetcher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub use feed::FeedAdapter;
pub use filter::{MarkerFilter, MarkerGroup, SeverityFilter};
pub use scrape::{ScrapeAdapter, DEFAULT_FALLBACK_TITLE};

pub const CRATE_NAME: &str = "bugdaily-adapters";

/// Per-run facts shared by every adapter. `observed_at` stands in for "now".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub observed_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(observed_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            observed_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error("feed parse failed: {0}")]
    Feed(#[from] feed_rs::parser::ParseFeedError),
    #[error("source `{source_id}` misconfigured: {reason}")]
    Config { source_id: String, reason: String },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn platform(&self) -> Platform;

    /// Raw document for this run, or `None` when the source is unavailable.
    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Option<Vec<u8>>;

    /// Candidate reports from one fetched document. Malformed items are skipped, not errors.
    fn parse(&self, body: &[u8], ctx: &AdapterContext) -> Result<Vec<Report>, AdapterError>;

    /// Fetch then parse; an unavailable or unparseable source yields no candidates.
    async fn collect(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Vec<Report> {
        let Some(body) = self.fetch(http, ctx).await else {
            warn!(run_id = %ctx.run_id, source_id = self.source_id(), "source unavailable this run");
            return Vec::new();
        };
        match self.parse(&body, ctx) {
            Ok(reports) => {
                info!(
                    run_id = %ctx.run_id,
                    source_id = self.source_id(),
                    candidates = reports.len(),
                    "source parsed"
                );
                reports
            }
            Err(err) => {
                warn!(run_id = %ctx.run_id, source_id = self.source_id(), error = %err, "source unparseable this run");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Feed,
    Scrape,
}

/// One entry of the source registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub platform: Platform,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub severity_markers: Vec<MarkerGroup>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub card_selector: Option<String>,
    #[serde(default)]
    pub fallback_title: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_severity() -> Severity {
    Severity::Critical
}

impl SourceConfig {
    fn misconfigured(&self, reason: impl Into<String>) -> AdapterError {
        AdapterError::Config {
            source_id: self.source_id.clone(),
            reason: reason.into(),
        }
    }

    fn marker_filter(&self) -> Result<MarkerFilter, AdapterError> {
        if self.severity_markers.is_empty() {
            return Err(self.misconfigured("severity_markers must not be empty"));
        }
        let filter = MarkerFilter::new(self.severity, self.severity_markers.clone());
        if filter.groups().iter().any(|g| g.contains_any.is_empty()) {
            return Err(self.misconfigured("every severity marker group needs at least one marker"));
        }
        Ok(filter)
    }
}

pub fn adapter_for_source(config: &SourceConfig) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    if config.url.trim().is_empty() {
        return Err(config.misconfigured("url must not be empty"));
    }
    let filter = Box::new(config.marker_filter()?);
    match config.kind {
        SourceKind::Feed => Ok(Box::new(FeedAdapter::new(
            &config.source_id,
            config.platform,
            &config.url,
            filter,
        ))),
        SourceKind::Scrape => {
            let origin = config
                .origin
                .as_deref()
                .ok_or_else(|| config.misconfigured("scrape sources need an origin"))?;
            let card_selector = config
                .card_selector
                .as_deref()
                .ok_or_else(|| config.misconfigured("scrape sources need a card_selector"))?;
            let adapter = ScrapeAdapter::new(
                &config.source_id,
                config.platform,
                &config.url,
                origin,
                card_selector,
                filter,
            )?
            .with_fallback_title(
                config
                    .fallback_title
                    .as_deref()
                    .unwrap_or(DEFAULT_FALLBACK_TITLE),
            );
            Ok(Box::new(adapter))
        }
    }
}
