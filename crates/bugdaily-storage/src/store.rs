use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bugdaily_core::{Platform, Report, Severity};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use crate::merge::{merge_report, upsert_statement, ReportColumn, REPORTS_TABLE};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored row is not a valid report: {0}")]
    Decode(String),
    #[error("batch already committed")]
    BatchClosed,
}

/// Records whose `published_at` falls before `now - days` are purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl RetentionPolicy {
    pub fn horizon(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(i64::from(self.days))
    }
}

/// One all-or-nothing unit of writes. Dropping a batch without `commit` discards it.
#[async_trait]
pub trait ReportBatch: Send {
    async fn upsert(&mut self, report: &Report) -> Result<(), StoreError>;

    /// Delete every report published before `horizon`; returns the number removed.
    async fn purge_before(&mut self, horizon: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn ReportBatch>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgReportStore {
    pool: PgPool,
    upsert_sql: Arc<str>,
}

impl PgReportStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            upsert_sql: Arc::from(upsert_statement()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn find_by_hash(&self, hash: &str) -> Result<Option<Report>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {REPORTS_TABLE} WHERE hash = $1",
            column_list()
        ))
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| report_from_row(&r)).transpose()
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {REPORTS_TABLE}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(total)
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn begin(&self) -> Result<Box<dyn ReportBatch>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgReportBatch {
            tx: Some(tx),
            upsert_sql: self.upsert_sql.clone(),
        }))
    }
}

pub struct PgReportBatch {
    tx: Option<Transaction<'static, Postgres>>,
    upsert_sql: Arc<str>,
}

#[async_trait]
impl ReportBatch for PgReportBatch {
    async fn upsert(&mut self, report: &Report) -> Result<(), StoreError> {
        let tx = self.tx.as_mut().ok_or(StoreError::BatchClosed)?;
        let mut query = sqlx::query(&self.upsert_sql);
        for column in ReportColumn::ALL {
            query = bind_column(query, column, report);
        }
        query.execute(&mut **tx).await?;
        Ok(())
    }

    async fn purge_before(&mut self, horizon: DateTime<Utc>) -> Result<u64, StoreError> {
        let tx = self.tx.as_mut().ok_or(StoreError::BatchClosed)?;
        let result = sqlx::query(&format!(
            "DELETE FROM {REPORTS_TABLE} WHERE published_at < $1"
        ))
        .bind(horizon)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::BatchClosed)?;
        tx.commit().await?;
        Ok(())
    }
}

fn bind_column<'q>(
    query: Query<'q, Postgres, PgArguments>,
    column: ReportColumn,
    report: &'q Report,
) -> Query<'q, Postgres, PgArguments> {
    match column {
        ReportColumn::SourceId => query.bind(report.source_id.as_str()),
        ReportColumn::Title => query.bind(report.title.as_str()),
        ReportColumn::Platform => query.bind(report.platform.as_str()),
        ReportColumn::Severity => query.bind(report.severity.as_str()),
        ReportColumn::Program => query.bind(report.program.as_deref()),
        ReportColumn::Bounty => query.bind(report.bounty),
        ReportColumn::Currency => query.bind(report.currency.as_deref()),
        ReportColumn::PublishedAt => query.bind(report.published_at),
        ReportColumn::Url => query.bind(report.url.as_str()),
        ReportColumn::Weakness => query.bind(report.weakness.as_deref()),
        ReportColumn::Hash => query.bind(report.hash.as_str()),
    }
}

fn column_list() -> String {
    ReportColumn::ALL
        .iter()
        .map(ReportColumn::name)
        .collect::<Vec<_>>()
        .join(", ")
}

fn report_from_row(row: &PgRow) -> Result<Report, StoreError> {
    let platform: String = row.try_get("platform")?;
    let severity: String = row.try_get("severity")?;
    Ok(Report {
        source_id: row.try_get("source_id")?,
        title: row.try_get("title")?,
        platform: platform
            .parse::<Platform>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        severity: severity
            .parse::<Severity>()
            .map_err(|e| StoreError::Decode(e.to_string()))?,
        program: row.try_get("program")?,
        bounty: row.try_get("bounty")?,
        currency: row.try_get("currency")?,
        published_at: row.try_get("published_at")?,
        url: row.try_get("url")?,
        weakness: row.try_get("weakness")?,
        hash: row.try_get("hash")?,
    })
}

/// Process-local store keyed by fingerprint, applying the same merge table as Postgres.
///
/// A batch stages a copy of the rows and swaps it in on commit, so overlapping batches are
/// last-commit-wins rather than merged.
#[derive(Debug, Clone, Default)]
pub struct MemoryReportStore {
    rows: Arc<Mutex<BTreeMap<String, Report>>>,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert rows as-is, replacing any with the same hash.
    pub async fn seed(&self, reports: impl IntoIterator<Item = Report>) {
        let mut rows = self.rows.lock().await;
        for report in reports {
            rows.insert(report.hash.clone(), report);
        }
    }

    pub async fn get(&self, hash: &str) -> Option<Report> {
        self.rows.lock().await.get(hash).cloned()
    }

    pub async fn all(&self) -> Vec<Report> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn begin(&self) -> Result<Box<dyn ReportBatch>, StoreError> {
        let staged = self.rows.lock().await.clone();
        Ok(Box::new(MemoryReportBatch {
            rows: self.rows.clone(),
            staged: Some(staged),
        }))
    }
}

struct MemoryReportBatch {
    rows: Arc<Mutex<BTreeMap<String, Report>>>,
    staged: Option<BTreeMap<String, Report>>,
}

#[async_trait]
impl ReportBatch for MemoryReportBatch {
    async fn upsert(&mut self, report: &Report) -> Result<(), StoreError> {
        let staged = self.staged.as_mut().ok_or(StoreError::BatchClosed)?;
        match staged.get_mut(&report.hash) {
            Some(stored) => {
                debug!(hash = %report.hash, "merging into existing report");
                merge_report(stored, report);
            }
            None => {
                staged.insert(report.hash.clone(), report.clone());
            }
        }
        Ok(())
    }

    async fn purge_before(&mut self, horizon: DateTime<Utc>) -> Result<u64, StoreError> {
        let staged = self.staged.as_mut().ok_or(StoreError::BatchClosed)?;
        let before = staged.len();
        staged.retain(|_, report| report.published_at >= horizon);
        Ok((before - staged.len()) as u64)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let staged = self.staged.take().ok_or(StoreError::BatchClosed)?;
        *self.rows.lock().await = staged;
        Ok(())
    }
}
