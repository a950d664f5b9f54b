//! Core domain model for BugDaily: the disclosed report, its fingerprint, and text normalization.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "bugdaily-core";

/// Currency recorded for every ingested report until a source exposes real bounty data.
pub const DEFAULT_CURRENCY: &str = "USD";

const FINGERPRINT_SEPARATOR: char = '|';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseEnumError {
    #[error("unknown platform `{0}`")]
    Platform(String),
    #[error("unknown severity `{0}`")]
    Severity(String),
}

/// Bug bounty platforms the pipeline knows how to attribute reports to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Platform {
    HackerOne,
    Bugcrowd,
    Intigriti,
    YesWeHack,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::HackerOne,
        Platform::Bugcrowd,
        Platform::Intigriti,
        Platform::YesWeHack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::HackerOne => "HackerOne",
            Platform::Bugcrowd => "Bugcrowd",
            Platform::Intigriti => "Intigriti",
            Platform::YesWeHack => "YesWeHack",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError::Platform(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    None,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::None => "none",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Severity::Critical),
            "high" => Ok(Severity::High),
            "medium" => Ok(Severity::Medium),
            "low" => Ok(Severity::Low),
            "none" => Ok(Severity::None),
            _ => Err(ParseEnumError::Severity(s.to_string())),
        }
    }
}

/// A publicly disclosed bounty report as persisted in the `reports` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub source_id: String,
    pub title: String,
    pub platform: Platform,
    pub severity: Severity,
    pub program: Option<String>,
    pub bounty: Option<f64>,
    pub currency: Option<String>,
    pub published_at: DateTime<Utc>,
    pub url: String,
    pub weakness: Option<String>,
    pub hash: String,
}

impl Report {
    /// Build a report from what a listing exposes: link, title and a timestamp.
    ///
    /// The canonical URL doubles as `source_id`. Bounty metadata is left unknown apart from
    /// the default currency.
    pub fn from_listing(
        platform: Platform,
        severity: Severity,
        url: &str,
        title: &str,
        published_at: DateTime<Utc>,
    ) -> Self {
        let url = normalize_text(url);
        let title = normalize_text(title);
        let hash = fingerprint(platform, &url, &title);
        Self {
            source_id: url.clone(),
            title,
            platform,
            severity,
            program: None,
            bounty: None,
            currency: Some(DEFAULT_CURRENCY.to_string()),
            published_at,
            url,
            weakness: None,
            hash,
        }
    }
}

/// Trim and collapse every whitespace run to a single space. `None` becomes the empty string.
pub fn normalize_text<'a>(input: impl Into<Option<&'a str>>) -> String {
    input
        .into()
        .unwrap_or_default()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Dedup key over `platform|url|title`, lowercased after whitespace normalization.
pub fn fingerprint(platform: Platform, url: &str, title: &str) -> String {
    let key = format!(
        "{}{sep}{}{sep}{}",
        platform.as_str(),
        normalize_text(url),
        normalize_text(title),
        sep = FINGERPRINT_SEPARATOR
    )
    .to_lowercase();
    sha256_hex(key.as_bytes())
}
