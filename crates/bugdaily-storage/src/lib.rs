//! Persistence and HTTP fetch utilities for BugDaily.

mod fetch;
pub mod merge;
mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use fetch::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy, DEFAULT_USER_AGENT,
};
pub use merge::{merge_report, upsert_statement, MergeRule, ReportColumn, REPORT_MERGE_RULES};
pub use store::{
    MemoryReportStore, PgReportBatch, PgReportStore, ReportBatch, ReportStore, RetentionPolicy,
    StoreError, DEFAULT_RETENTION_DAYS,
};

pub const CRATE_NAME: &str = "bugdaily-storage";
