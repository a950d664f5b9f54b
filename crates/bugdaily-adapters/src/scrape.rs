use async_trait::async_trait;
use bugdaily_core::{normalize_text, Platform, Report};
use bugdaily_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::{AdapterContext, AdapterError, SeverityFilter, SourceAdapter};

pub const DEFAULT_FALLBACK_TITLE: &str = "Disclosed report";

const ANCHOR_SELECTOR: &str = "a[href]";

/// Listing page of report cards. The page carries no trustworthy dates, so every card is
/// stamped with the run's observation time.
#[derive(Debug)]
pub struct ScrapeAdapter {
    source_id: String,
    platform: Platform,
    url: String,
    origin: String,
    card_selector: String,
    fallback_title: String,
    filter: Box<dyn SeverityFilter>,
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn element_text(element: &ElementRef<'_>) -> String {
    normalize_text(element.text().collect::<Vec<_>>().join(" ").as_str())
}

/// Resolve a card href against the site origin.
fn absolute_url(origin: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if let Some(rest) = href.strip_prefix("//") {
        return format!("https://{rest}");
    }
    let origin = origin.trim_end_matches('/');
    if href.starts_with('/') {
        format!("{origin}{href}")
    } else {
        format!("{origin}/{href}")
    }
}

impl ScrapeAdapter {
    pub fn new(
        source_id: &str,
        platform: Platform,
        url: &str,
        origin: &str,
        card_selector: &str,
        filter: Box<dyn SeverityFilter>,
    ) -> Result<Self, AdapterError> {
        parse_selector(card_selector)?;
        Ok(Self {
            source_id: source_id.to_string(),
            platform,
            url: url.to_string(),
            origin: origin.to_string(),
            card_selector: card_selector.to_string(),
            fallback_title: DEFAULT_FALLBACK_TITLE.to_string(),
            filter,
        })
    }

    pub fn with_fallback_title(mut self, title: &str) -> Self {
        self.fallback_title = title.to_string();
        self
    }

    fn card_to_report(
        &self,
        card: &ElementRef<'_>,
        anchor: &Selector,
        ctx: &AdapterContext,
    ) -> Option<Report> {
        let text = element_text(card).to_lowercase();
        if !self.filter.matches(&text) {
            return None;
        }

        let Some((link, href)) = card.select(anchor).find_map(|a| {
            a.value()
                .attr("href")
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(|h| (a, h))
        }) else {
            debug!(source_id = %self.source_id, "skipping card without link");
            return None;
        };

        let mut title = element_text(&link);
        if title.is_empty() {
            title = self.fallback_title.clone();
        }

        Some(Report::from_listing(
            self.platform,
            self.filter.severity(),
            &absolute_url(&self.origin, href),
            &title,
            ctx.observed_at,
        ))
    }
}

#[async_trait]
impl SourceAdapter for ScrapeAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Option<Vec<u8>> {
        http.fetch_with_retry(ctx.run_id, &self.source_id, &self.url)
            .await
            .map(|resp| resp.body)
            .filter(|body| !body.is_empty())
    }

    fn parse(&self, body: &[u8], ctx: &AdapterContext) -> Result<Vec<Report>, AdapterError> {
        let cards = parse_selector(&self.card_selector)?;
        let anchor = parse_selector(ANCHOR_SELECTOR)?;
        let document = Html::parse_document(&String::from_utf8_lossy(body));
        Ok(document
            .select(&cards)
            .filter_map(|card| self.card_to_report(&card, &anchor, ctx))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MarkerFilter;
    use bugdaily_core::{fingerprint, Severity, DEFAULT_CURRENCY};
    use bugdaily_storage::testing::{serve_sequence, CannedResponse};
    use bugdaily_storage::{HttpClientConfig, RetryPolicy};
    use chrono::{DateTime, TimeZone, Utc};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture() -> Vec<u8> {
        std::fs::read(workspace_root().join("fixtures/bugcrowd/crowdstream.html"))
            .expect("crowdstream fixture")
    }

    fn observed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 5, 6, 0, 0).single().unwrap()
    }

    fn adapter(url: &str) -> ScrapeAdapter {
        ScrapeAdapter::new(
            "bugcrowd-crowdstream",
            Platform::Bugcrowd,
            url,
            "https://bugcrowd.com",
            "[data-test='crowdstream-card']",
            Box::new(MarkerFilter::disclosed_critical()),
        )
        .unwrap()
    }

    fn fast_http() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
            },
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn keeps_disclosed_critical_cards_with_links() {
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter("https://bugcrowd.com/crowdstream")
            .parse(&fixture(), &ctx)
            .unwrap();

        let urls = reports.iter().map(|r| r.url.as_str()).collect::<Vec<_>>();
        assert_eq!(
            urls,
            vec![
                "https://bugcrowd.com/disclosures/abc-123",
                "https://bugcrowd.com/disclosures/def-456",
            ]
        );
    }

    #[test]
    fn card_fields_map_onto_report() {
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter("https://bugcrowd.com/crowdstream")
            .parse(&fixture(), &ctx)
            .unwrap();
        let rce = &reports[0];

        assert_eq!(rce.title, "Remote code execution via avatar upload");
        assert_eq!(rce.platform, Platform::Bugcrowd);
        assert_eq!(rce.severity, Severity::Critical);
        assert_eq!(rce.published_at, observed_at());
        assert_eq!(rce.currency.as_deref(), Some(DEFAULT_CURRENCY));
        assert_eq!(
            rce.hash,
            fingerprint(
                Platform::Bugcrowd,
                "https://bugcrowd.com/disclosures/abc-123",
                "Remote code execution via avatar upload"
            )
        );
    }

    #[test]
    fn empty_anchor_text_uses_fallback_title() {
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter("https://bugcrowd.com/crowdstream")
            .parse(&fixture(), &ctx)
            .unwrap();
        assert_eq!(reports[1].title, DEFAULT_FALLBACK_TITLE);

        let custom = adapter("https://bugcrowd.com/crowdstream")
            .with_fallback_title("Untitled disclosure")
            .parse(&fixture(), &ctx)
            .unwrap();
        assert_eq!(custom[1].title, "Untitled disclosure");
    }

    #[test]
    fn critical_card_that_is_not_disclosed_is_excluded() {
        let html = r#"<div data-test="crowdstream-card">Triaged Critical <a href="/d/1">SQLi</a></div>"#;
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter("https://bugcrowd.com/crowdstream")
            .parse(html.as_bytes(), &ctx)
            .unwrap();
        assert!(reports.is_empty());
    }

    #[test]
    fn blank_href_is_passed_over_for_the_next_anchor() {
        let html = r#"<div data-test="crowdstream-card">Disclosed P1
<a href="">Share</a> <a href=" /disclosures/ghi-789 ">IDOR in invoices</a></div>
<div data-test="crowdstream-card">Disclosed Critical <a href="  ">Nothing</a></div>"#;
        let ctx = AdapterContext::new(observed_at());
        let reports = adapter("https://bugcrowd.com/crowdstream")
            .parse(html.as_bytes(), &ctx)
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].url, "https://bugcrowd.com/disclosures/ghi-789");
        assert_eq!(reports[0].title, "IDOR in invoices");
    }

    #[test]
    fn hrefs_resolve_against_origin() {
        assert_eq!(
            absolute_url("https://bugcrowd.com/", "/disclosures/x"),
            "https://bugcrowd.com/disclosures/x"
        );
        assert_eq!(
            absolute_url("https://bugcrowd.com", "disclosures/x"),
            "https://bugcrowd.com/disclosures/x"
        );
        assert_eq!(
            absolute_url("https://bugcrowd.com", "https://other.example/x"),
            "https://other.example/x"
        );
        assert_eq!(
            absolute_url("https://bugcrowd.com", "//cdn.example/x"),
            "https://cdn.example/x"
        );
    }

    #[tokio::test]
    async fn collect_recovers_after_transient_failures() {
        let server = serve_sequence(vec![
            CannedResponse::status(502),
            CannedResponse::status(500),
            CannedResponse::ok(String::from_utf8(fixture()).unwrap()),
        ])
        .await
        .unwrap();
        let ctx = AdapterContext::new(observed_at());

        let reports = adapter(&server.url("/crowdstream"))
            .collect(&fast_http(), &ctx)
            .await;

        assert_eq!(reports.len(), 2);
        assert_eq!(server.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn collect_is_empty_when_every_attempt_fails() {
        let server = serve_sequence(vec![CannedResponse::status(503)]).await.unwrap();
        let ctx = AdapterContext::new(observed_at());

        let reports = adapter(&server.url("/crowdstream"))
            .collect(&fast_http(), &ctx)
            .await;

        assert!(reports.is_empty());
        assert_eq!(server.hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_page_is_treated_as_unavailable() {
        let server = serve_sequence(vec![CannedResponse::ok("")]).await.unwrap();
        let ctx = AdapterContext::new(observed_at());
        let adapter = adapter(&server.url("/crowdstream"));
        assert!(adapter.fetch(&fast_http(), &ctx).await.is_none());
    }
}
