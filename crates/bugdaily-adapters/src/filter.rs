use std::fmt::Debug;

use bugdaily_core::Severity;
use serde::{Deserialize, Serialize};

/// Decides from a source's lowercased text whether an item is severe enough to keep.
pub trait SeverityFilter: Send + Sync + Debug {
    fn matches(&self, blob: &str) -> bool;

    /// Classification stamped on every item the filter accepts.
    fn severity(&self) -> Severity;
}

/// Any one of `contains_any` must appear in the text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerGroup {
    pub contains_any: Vec<String>,
}

impl MarkerGroup {
    pub fn any_of<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            contains_any: markers.into_iter().map(Into::into).collect(),
        }
    }
}

/// Case-insensitive substring filter: every group must have at least one hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerFilter {
    severity: Severity,
    groups: Vec<MarkerGroup>,
}

impl MarkerFilter {
    pub fn new(severity: Severity, groups: Vec<MarkerGroup>) -> Self {
        let groups = groups
            .into_iter()
            .map(|g| MarkerGroup {
                contains_any: g
                    .contains_any
                    .iter()
                    .map(|m| m.trim().to_lowercase())
                    .filter(|m| !m.is_empty())
                    .collect(),
            })
            .collect();
        Self { severity, groups }
    }

    pub fn groups(&self) -> &[MarkerGroup] {
        &self.groups
    }

    /// Feed entries mentioning "critical".
    pub fn critical() -> Self {
        Self::new(Severity::Critical, vec![MarkerGroup::any_of(["critical"])])
    }

    /// Publicly disclosed cards rated P1 or critical.
    pub fn disclosed_critical() -> Self {
        Self::new(
            Severity::Critical,
            vec![
                MarkerGroup::any_of(["disclosed"]),
                MarkerGroup::any_of(["p1", "critical"]),
            ],
        )
    }
}

impl SeverityFilter for MarkerFilter {
    fn matches(&self, blob: &str) -> bool {
        let blob = blob.to_lowercase();
        self.groups
            .iter()
            .all(|g| g.contains_any.iter().any(|m| blob.contains(m.as_str())))
    }

    fn severity(&self) -> Severity {
        self.severity
    }
}
