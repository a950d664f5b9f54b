//! Ingest run orchestration: configuration, source registry, and the one-shot batch pipeline.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use bugdaily_adapters::{adapter_for_source, AdapterContext, AdapterError, SourceAdapter, SourceConfig};
use bugdaily_core::Report;
use bugdaily_storage::{
    HttpClientConfig, HttpFetcher, PgReportStore, ReportStore, RetentionPolicy, RetryPolicy,
    DEFAULT_RETENTION_DAYS, DEFAULT_USER_AGENT,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bugdaily-sync";

const BUILTIN_SOURCES: &str = include_str!("../../../sources.yaml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("reading source registry {path:?}: {source}")]
    RegistryIo {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing source registry: {0}")]
    RegistryFormat(#[from] serde_yaml::Error),
    #[error("source registry lists `{0}` more than once")]
    DuplicateSource(String),
    #[error(transparent)]
    Source(#[from] AdapterError),
}

/// Everything a run needs, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    pub database_url: String,
    pub retention_days: u32,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_attempts: usize,
    pub fetch_base_delay_ms: u64,
    pub sources_path: Option<PathBuf>,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = non_empty(&lookup, "DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let retention_days = parse_or(&lookup, "RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?;
        if retention_days == 0 {
            return Err(ConfigError::Invalid {
                key: "RETENTION_DAYS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        let fetch_attempts = parse_or(&lookup, "BUGDAILY_FETCH_ATTEMPTS", 3usize)?;
        if fetch_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "BUGDAILY_FETCH_ATTEMPTS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        Ok(Self {
            database_url,
            retention_days,
            user_agent: non_empty(&lookup, "BUGDAILY_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: parse_or(&lookup, "BUGDAILY_HTTP_TIMEOUT_SECS", 25)?,
            fetch_attempts,
            fetch_base_delay_ms: parse_or(&lookup, "BUGDAILY_FETCH_BASE_DELAY_MS", 2000)?,
            sources_path: non_empty(&lookup, "BUGDAILY_SOURCES").map(PathBuf::from),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            retry: RetryPolicy {
                max_attempts: self.fetch_attempts,
                base_delay: Duration::from_millis(self.fetch_base_delay_ms),
            },
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            days: self.retention_days,
        }
    }

    /// Connection string with any password masked, for logs.
    pub fn redacted_database_url(&self) -> String {
        let Some((scheme, rest)) = self.database_url.split_once("://") else {
            return "***".to_string();
        };
        match rest.rsplit_once('@') {
            Some((userinfo, host)) => {
                let user = userinfo.split(':').next().unwrap_or_default();
                format!("{scheme}://{user}:***@{host}")
            }
            None => self.database_url.clone(),
        }
    }

    pub fn log_redacted(&self) {
        info!(
            database_url = %self.redacted_database_url(),
            retention_days = self.retention_days,
            fetch_attempts = self.fetch_attempts,
            fetch_base_delay_ms = self.fetch_base_delay_ms,
            http_timeout_secs = self.http_timeout_secs,
            sources = %self
                .sources_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "builtin".to_string()),
            "ingest configuration"
        );
    }
}

fn non_empty<F: Fn(&str) -> Option<String>>(lookup: &F, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match non_empty(lookup, key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    /// The registry compiled in from the workspace `sources.yaml`.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml(BUILTIN_SOURCES)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let registry: SourceRegistry = serde_yaml::from_str(text)?;
        let mut seen = HashSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                return Err(ConfigError::DuplicateSource(source.source_id.clone()));
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::RegistryIo {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_yaml(&text)
    }

    pub async fn for_config(config: &IngestConfig) -> Result<Self, ConfigError> {
        match &config.sources_path {
            Some(path) => Self::load(path).await,
            None => Self::builtin(),
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub candidates_by_source: BTreeMap<String, usize>,
    pub upserted: usize,
    pub purged: u64,
    pub retention_horizon: DateTime<Utc>,
}

pub struct SyncPipeline {
    config: IngestConfig,
    http: HttpFetcher,
    adapters: Vec<Box<dyn SourceAdapter>>,
    store: Box<dyn ReportStore>,
}

impl SyncPipeline {
    /// Builds every enabled adapter up front so a bad registry fails before anything is fetched.
    pub fn new(
        config: IngestConfig,
        registry: &SourceRegistry,
        store: Box<dyn ReportStore>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let adapters = registry
            .enabled()
            .map(adapter_for_source)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ConfigError::from)?;
        Ok(Self {
            config,
            http,
            adapters,
            store,
        })
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.source_id()).collect()
    }

    /// Every adapter's candidates, one adapter after another in registry order.
    pub async fn collect_candidates(
        &self,
        ctx: &AdapterContext,
    ) -> (Vec<Report>, BTreeMap<String, usize>) {
        let mut candidates = Vec::new();
        let mut per_source = BTreeMap::new();
        for adapter in &self.adapters {
            let reports = adapter.collect(&self.http, ctx).await;
            per_source.insert(adapter.source_id().to_string(), reports.len());
            candidates.extend(reports);
        }
        (candidates, per_source)
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_at(Utc::now()).await
    }

    /// One batch with `observed_at` as the run's notion of "now".
    pub async fn run_at(&self, observed_at: DateTime<Utc>) -> Result<SyncRunSummary> {
        let ctx = AdapterContext::new(observed_at);
        let span = info_span!("sync_run", run_id = %ctx.run_id);
        self.run_in_context(ctx).instrument(span).await
    }

    async fn run_in_context(&self, ctx: AdapterContext) -> Result<SyncRunSummary> {
        info!(sources = self.adapters.len(), "sync run starting");
        let (candidates, candidates_by_source) = self.collect_candidates(&ctx).await;

        let mut batch = self.store.begin().await.context("opening store batch")?;
        for report in &candidates {
            batch
                .upsert(report)
                .await
                .with_context(|| format!("upserting report {} ({})", report.hash, report.url))?;
        }

        let retention_horizon = self.config.retention_policy().horizon(ctx.observed_at);
        let purged = batch
            .purge_before(retention_horizon)
            .await
            .context("purging expired reports")?;
        batch.commit().await.context("committing sync batch")?;

        let summary = SyncRunSummary {
            run_id: ctx.run_id,
            started_at: ctx.observed_at,
            finished_at: Utc::now(),
            enabled_sources: self.adapters.len(),
            candidates_by_source,
            upserted: candidates.len(),
            purged,
            retention_horizon,
        };
        info!(
            upserted = summary.upserted,
            purged = summary.purged,
            horizon = %summary.retention_horizon,
            "sync run committed"
        );
        Ok(summary)
    }
}

async fn connect_store(config: &IngestConfig) -> Result<PgReportStore> {
    let store = PgReportStore::connect(&config.database_url)
        .await
        .with_context(|| format!("connecting to {}", config.redacted_database_url()))?;
    store.migrate().await.context("applying migrations")?;
    Ok(store)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = IngestConfig::from_env()?;
    config.log_redacted();
    let registry = SourceRegistry::for_config(&config).await?;
    let store = connect_store(&config).await?;
    let pipeline = SyncPipeline::new(config, &registry, Box::new(store))?;
    pipeline.run_once().await
}

pub async fn migrate_from_env() -> Result<()> {
    let config = IngestConfig::from_env()?;
    connect_store(&config).await?;
    info!("migrations applied");
    Ok(())
}
