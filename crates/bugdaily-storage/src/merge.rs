//! Field-level conflict policy for report upserts.
//!
//! `REPORT_MERGE_RULES` is the single source of truth: it renders the Postgres
//! `ON CONFLICT ... DO UPDATE SET` clause and drives the in-memory store, so both
//! backends resolve a fingerprint collision the same way. Columns without a rule keep
//! their stored value.

use bugdaily_core::Report;

pub const REPORTS_TABLE: &str = "reports";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportColumn {
    SourceId,
    Title,
    Platform,
    Severity,
    Program,
    Bounty,
    Currency,
    PublishedAt,
    Url,
    Weakness,
    Hash,
}

impl ReportColumn {
    /// Insert order; bind parameters follow it.
    pub const ALL: [ReportColumn; 11] = [
        ReportColumn::SourceId,
        ReportColumn::Title,
        ReportColumn::Platform,
        ReportColumn::Severity,
        ReportColumn::Program,
        ReportColumn::Bounty,
        ReportColumn::Currency,
        ReportColumn::PublishedAt,
        ReportColumn::Url,
        ReportColumn::Weakness,
        ReportColumn::Hash,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReportColumn::SourceId => "source_id",
            ReportColumn::Title => "title",
            ReportColumn::Platform => "platform",
            ReportColumn::Severity => "severity",
            ReportColumn::Program => "program",
            ReportColumn::Bounty => "bounty",
            ReportColumn::Currency => "currency",
            ReportColumn::PublishedAt => "published_at",
            ReportColumn::Url => "url",
            ReportColumn::Weakness => "weakness",
            ReportColumn::Hash => "hash",
        }
    }

    fn apply(&self, rule: MergeRule, stored: &mut Report, incoming: &Report) {
        match self {
            ReportColumn::SourceId => rule.resolve(&mut stored.source_id, &incoming.source_id),
            ReportColumn::Title => rule.resolve(&mut stored.title, &incoming.title),
            ReportColumn::Platform => rule.resolve(&mut stored.platform, &incoming.platform),
            ReportColumn::Severity => rule.resolve(&mut stored.severity, &incoming.severity),
            ReportColumn::Program => rule.resolve_nullable(&mut stored.program, &incoming.program),
            ReportColumn::Bounty => rule.resolve_nullable(&mut stored.bounty, &incoming.bounty),
            ReportColumn::Currency => {
                rule.resolve_nullable(&mut stored.currency, &incoming.currency)
            }
            ReportColumn::PublishedAt => {
                rule.resolve(&mut stored.published_at, &incoming.published_at)
            }
            ReportColumn::Url => rule.resolve(&mut stored.url, &incoming.url),
            ReportColumn::Weakness => {
                rule.resolve_nullable(&mut stored.weakness, &incoming.weakness)
            }
            ReportColumn::Hash => rule.resolve(&mut stored.hash, &incoming.hash),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Stored value stays.
    Keep,
    /// Incoming value replaces the stored one unconditionally.
    Overwrite,
    /// Incoming value wins unless it is null.
    Coalesce,
    /// The greater of stored and incoming.
    Latest,
}

impl MergeRule {
    fn resolve<T: Clone + PartialOrd>(self, stored: &mut T, incoming: &T) {
        match self {
            MergeRule::Keep => {}
            MergeRule::Overwrite | MergeRule::Coalesce => *stored = incoming.clone(),
            MergeRule::Latest => {
                if *incoming > *stored {
                    *stored = incoming.clone();
                }
            }
        }
    }

    fn resolve_nullable<T: Clone + PartialOrd>(self, stored: &mut Option<T>, incoming: &Option<T>) {
        match (self, incoming) {
            (MergeRule::Keep, _) => {}
            (MergeRule::Overwrite, _) => *stored = incoming.clone(),
            (MergeRule::Coalesce, Some(_)) => *stored = incoming.clone(),
            (MergeRule::Coalesce, None) => {}
            // GREATEST() ignores nulls.
            (MergeRule::Latest, Some(value)) => {
                if stored.as_ref().map_or(true, |current| value > current) {
                    *stored = Some(value.clone());
                }
            }
            (MergeRule::Latest, None) => {}
        }
    }

    fn sql_expr(self, column: &str) -> Option<String> {
        match self {
            MergeRule::Keep => None,
            MergeRule::Overwrite => Some(format!("EXCLUDED.{column}")),
            MergeRule::Coalesce => Some(format!(
                "COALESCE(EXCLUDED.{column}, {REPORTS_TABLE}.{column})"
            )),
            MergeRule::Latest => Some(format!(
                "GREATEST(EXCLUDED.{column}, {REPORTS_TABLE}.{column})"
            )),
        }
    }
}

pub const REPORT_MERGE_RULES: &[(ReportColumn, MergeRule)] = &[
    (ReportColumn::Title, MergeRule::Overwrite),
    (ReportColumn::Program, MergeRule::Coalesce),
    (ReportColumn::Bounty, MergeRule::Coalesce),
    (ReportColumn::Currency, MergeRule::Coalesce),
    (ReportColumn::PublishedAt, MergeRule::Latest),
];

pub fn rule_for(column: ReportColumn) -> MergeRule {
    REPORT_MERGE_RULES
        .iter()
        .find(|(c, _)| *c == column)
        .map(|(_, rule)| *rule)
        .unwrap_or(MergeRule::Keep)
}

/// Fold `incoming` into `stored` as the upsert would on a fingerprint conflict.
pub fn merge_report(stored: &mut Report, incoming: &Report) {
    for (column, rule) in REPORT_MERGE_RULES {
        column.apply(*rule, stored, incoming);
    }
}

/// The single-statement upsert keyed on `hash`.
pub fn upsert_statement() -> String {
    let columns = ReportColumn::ALL
        .iter()
        .map(ReportColumn::name)
        .collect::<Vec<_>>();
    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>();
    let assignments = REPORT_MERGE_RULES
        .iter()
        .filter_map(|(column, rule)| {
            rule.sql_expr(column.name())
                .map(|expr| format!("{} = {expr}", column.name()))
        })
        .collect::<Vec<_>>();

    format!(
        "INSERT INTO {REPORTS_TABLE} ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET {}",
        columns.join(", "),
        placeholders.join(", "),
        ReportColumn::Hash.name(),
        assignments.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bugdaily_core::{Platform, Severity};
    use chrono::{Duration, TimeZone, Utc};

    fn report(title: &str) -> Report {
        Report::from_listing(
            Platform::HackerOne,
            Severity::Critical,
            "https://h1.example/r/7",
            title,
            Utc.with_ymd_and_hms(2026, 5, 2, 0, 0, 0).single().unwrap(),
        )
    }

    #[test]
    fn unlisted_columns_are_kept() {
        assert_eq!(rule_for(ReportColumn::Url), MergeRule::Keep);
        assert_eq!(rule_for(ReportColumn::Weakness), MergeRule::Keep);
        assert_eq!(rule_for(ReportColumn::Hash), MergeRule::Keep);
        assert_eq!(rule_for(ReportColumn::Title), MergeRule::Overwrite);
        assert_eq!(rule_for(ReportColumn::PublishedAt), MergeRule::Latest);
    }

    #[test]
    fn statement_renders_every_rule() {
        let sql = upsert_statement();
        assert!(sql.starts_with(
            "INSERT INTO reports (source_id, title, platform, severity, program, bounty, currency, published_at, url, weakness, hash) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
        ));
        assert!(sql.contains("ON CONFLICT (hash) DO UPDATE SET"));
        assert!(sql.contains("title = EXCLUDED.title"));
        assert!(sql.contains("program = COALESCE(EXCLUDED.program, reports.program)"));
        assert!(sql.contains("bounty = COALESCE(EXCLUDED.bounty, reports.bounty)"));
        assert!(sql.contains("currency = COALESCE(EXCLUDED.currency, reports.currency)"));
        assert!(sql.contains("published_at = GREATEST(EXCLUDED.published_at, reports.published_at)"));
        assert!(!sql.contains("url = "));
        assert!(!sql.contains("weakness ="));
    }

    #[test]
    fn merge_overwrites_title_and_coalesces_nullable_fields() {
        let mut stored = report("Old title");
        stored.bounty = Some(250.0);
        stored.program = Some("acme".into());
        stored.weakness = Some("RCE".into());

        let mut incoming = report("New  title");
        incoming.bounty = None;
        incoming.program = Some("acme-corp".into());
        incoming.weakness = Some("SSRF".into());
        incoming.url = "https://elsewhere.example".into();

        merge_report(&mut stored, &incoming);

        assert_eq!(stored.title, "New title");
        assert_eq!(stored.bounty, Some(250.0));
        assert_eq!(stored.program.as_deref(), Some("acme-corp"));
        assert_eq!(stored.weakness.as_deref(), Some("RCE"));
        assert_eq!(stored.url, "https://h1.example/r/7");
    }

    #[test]
    fn published_at_only_moves_forward() {
        let mut stored = report("t");
        let later = stored.published_at + Duration::days(3);
        let earlier = stored.published_at - Duration::days(3);

        let mut incoming = report("t");
        incoming.published_at = later;
        merge_report(&mut stored, &incoming);
        assert_eq!(stored.published_at, later);

        incoming.published_at = earlier;
        merge_report(&mut stored, &incoming);
        assert_eq!(stored.published_at, later);
    }

    #[test]
    fn nullable_latest_ignores_nulls() {
        let mut stored: Option<f64> = None;
        MergeRule::Latest.resolve_nullable(&mut stored, &Some(10.0));
        assert_eq!(stored, Some(10.0));
        MergeRule::Latest.resolve_nullable(&mut stored, &None);
        assert_eq!(stored, Some(10.0));
        MergeRule::Latest.resolve_nullable(&mut stored, &Some(5.0));
        assert_eq!(stored, Some(10.0));
    }
}
