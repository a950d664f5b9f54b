use async_trait::async_trait;
use bugdaily_core::{normalize_text, Platform, Report};
use bugdaily_storage::HttpFetcher;
use feed_rs::model::Entry;
use tracing::{debug, info_span, warn, Instrument};

use crate::{AdapterContext, AdapterError, SeverityFilter, SourceAdapter};

/// RSS/Atom feed of disclosed reports. One plain GET per run; no retries.
#[derive(Debug)]
pub struct FeedAdapter {
    source_id: String,
    platform: Platform,
    url: String,
    filter: Box<dyn SeverityFilter>,
}

impl FeedAdapter {
    pub fn new(
        source_id: &str,
        platform: Platform,
        url: &str,
        filter: Box<dyn SeverityFilter>,
    ) -> Self {
        Self {
            source_id: source_id.to_string(),
            platform,
            url: url.to_string(),
            filter,
        }
    }

    fn entry_to_report(&self, entry: &Entry, ctx: &AdapterContext) -> Option<Report> {
        let title = normalize_text(entry.title.as_ref().map(|t| t.content.as_str()));
        if title.is_empty() {
            debug!(entry_id = %entry.id, "skipping feed entry without title");
            return None;
        }
        let summary = entry
            .summary
            .as_ref()
            .map(|t| t.content.as_str())
            .unwrap_or_default();
        let blob = format!("{title} {summary}").to_lowercase();
        if !self.filter.matches(&blob) {
            return None;
        }

        let Some(link) = entry
            .links
            .iter()
            .map(|l| l.href.trim())
            .find(|href| !href.is_empty())
        else {
            debug!(entry_id = %entry.id, "skipping feed entry without link");
            return None;
        };

        // Entries without a usable date are stamped with the observation time.
        let published_at = entry.published.unwrap_or(ctx.observed_at);

        Some(Report::from_listing(
            self.platform,
            self.filter.severity(),
            link,
            &title,
            published_at,
        ))
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Option<Vec<u8>> {
        let span = info_span!("http_fetch", run_id = %ctx.run_id, source_id = %self.source_id, url = %self.url);
        async {
            match http.fetch_once(&self.url).await {
                Ok(resp) => Some(resp.body),
                Err(err) => {
                    warn!(error = %err, "feed fetch failed");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    fn parse(&self, body: &[u8], ctx: &AdapterContext) -> Result<Vec<Report>, AdapterError> {
        let feed = feed_rs::parser::parse(body)?;
        Ok(feed
            .entries
            .iter()
            .filter_map(|entry| self.entry_to_report(entry, ctx))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MarkerFilter;
    use bugdaily_core::{fingerprint, Severity, DEFAULT_CURRENCY};
    use bugdaily_storage::testing::{serve_sequence, unreachable_url, CannedResponse};
    use bugdaily_storage::HttpClientConfig;
    use chrono::{DateTime, TimeZone, Utc};
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture() -> Vec<u8> {
        std::fs::read(workspace_root().join("fixtures/hackerone/feed.xml")).expect("feed fixture")
    }

    fn observed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 5, 6, 0, 0).single().unwrap()
    }

    fn adapter(url: &str) -> FeedAdapter {
        FeedAdapter::new(
            "hackerone-feed",
            Platform::HackerOne,
            url,
            Box::new(MarkerFilter::critical()),
        )
    }

    #[test]
    fn keeps_only_critical_entries_with_links() {
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter("https://h1rss.example/rss").parse(&fixture(), &ctx).unwrap();

        let titles = reports.iter().map(|r| r.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Critical RCE in Foo", "Account takeover via password reset"]);
    }

    #[test]
    fn maps_entry_fields_onto_report() {
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter("https://h1rss.example/rss").parse(&fixture(), &ctx).unwrap();
        let rce = &reports[0];

        assert_eq!(rce.platform, Platform::HackerOne);
        assert_eq!(rce.severity, Severity::Critical);
        assert_eq!(rce.url, "https://h1.example/r/1");
        assert_eq!(rce.source_id, "https://h1.example/r/1");
        assert_eq!(
            rce.published_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).single().unwrap()
        );
        assert_eq!(rce.currency.as_deref(), Some(DEFAULT_CURRENCY));
        assert!(rce.program.is_none() && rce.bounty.is_none() && rce.weakness.is_none());
        assert_eq!(
            rce.hash,
            fingerprint(Platform::HackerOne, "https://h1.example/r/1", "Critical RCE in Foo")
        );
    }

    #[test]
    fn summary_marker_counts_and_missing_date_falls_back_to_observation_time() {
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter("https://h1rss.example/rss").parse(&fixture(), &ctx).unwrap();
        let ato = &reports[1];
        assert_eq!(ato.url, "https://h1.example/r/3");
        assert_eq!(ato.published_at, observed_at());
    }

    fn rss(items: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>h1</title><link>https://h1.example</link><description>d</description>
{items}
</channel></rss>"#
        )
        .into_bytes()
    }

    #[test]
    fn malformed_date_falls_back_without_dropping_siblings() {
        let body = rss(
            r#"<item><title>Critical A</title><link>https://h1.example/r/a</link><pubDate>not a date at all</pubDate></item>
<item><title>Critical B</title><link>https://h1.example/r/b</link><pubDate>Mon, 02 Mar 2026 10:00:00 +0000</pubDate></item>
<item><title>Critical C</title><link>   </link></item>"#,
        );
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter("https://h1rss.example/rss").parse(&body, &ctx).unwrap();

        let urls = reports.iter().map(|r| r.url.as_str()).collect::<Vec<_>>();
        assert_eq!(urls, vec!["https://h1.example/r/a", "https://h1.example/r/b"]);
        assert_eq!(reports[0].published_at, observed_at());
        assert_eq!(
            reports[1].published_at,
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).single().unwrap()
        );
    }

    #[test]
    fn untitled_entry_is_skipped_even_when_summary_is_critical() {
        let body = rss(
            r#"<item><link>https://h1.example/r/untitled</link><description>Critical RCE</description></item>
<item><title>Critical B</title><link>https://h1.example/r/b</link></item>"#,
        );
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter("https://h1rss.example/rss").parse(&body, &ctx).unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].title, "Critical B");
    }

    #[test]
    fn garbage_document_is_a_parse_error() {
        let ctx = AdapterContext::new(observed_at());
        let err = adapter("https://h1rss.example/rss")
            .parse(b"<html>not a feed", &ctx)
            .unwrap_err();
        assert!(matches!(err, AdapterError::Feed(_)));
    }

    #[tokio::test]
    async fn collect_fetches_and_parses_over_http() {
        let server = serve_sequence(vec![CannedResponse::xml(
            String::from_utf8(fixture()).unwrap(),
        )])
        .await
        .unwrap();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(observed_at());

        let reports = adapter(&server.url("/rss")).collect(&http, &ctx).await;
        assert_eq!(reports.len(), 2);
    }

    #[tokio::test]
    async fn unreachable_feed_yields_nothing() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter(&unreachable_url().unwrap()).collect(&http, &ctx).await;
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn unparseable_feed_yields_nothing() {
        let server = serve_sequence(vec![CannedResponse::ok("<<<")]).await.unwrap();
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter(&server.url("/rss")).collect(&http, &ctx).await;
        assert!(reports.is_empty());
    }
}
