//! Disjunctive test-marker selection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Marker that is always selected alongside backend markers.
pub const CORE_MARKER: &str = "core";

/// A set of markers joined by `or`. A test is selected when it carries any
/// one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerSelection {
    markers: Vec<String>,
}

impl MarkerSelection {
    /// Selection for a single job: its backend marker plus core.
    pub fn for_job(backend_marker: &str) -> Self {
        Self::from_markers([backend_marker])
    }

    /// Selection for a build acceptance check: every selected backend or core.
    pub fn for_build<'a>(backend_markers: impl IntoIterator<Item = &'a str>) -> Self {
        Self::from_markers(backend_markers)
    }

    fn from_markers<'a>(markers: impl IntoIterator<Item = &'a str>) -> Self {
        let mut seen = BTreeSet::new();
        let mut ordered = Vec::new();
        for marker in markers.into_iter().chain([CORE_MARKER]) {
            if seen.insert(marker) {
                ordered.push(marker.to_string());
            }
        }
        Self { markers: ordered }
    }

    pub fn markers(&self) -> &[String] {
        &self.markers
    }

    /// Marker expression, e.g. `duckdb or sqlite or core`.
    pub fn expression(&self) -> String {
        self.markers.join(" or ")
    }

    /// True if any of the test's markers is selected.
    pub fn matches<S: AsRef<str>>(&self, test_markers: &[S]) -> bool {
        test_markers
            .iter()
            .any(|m| self.markers.iter().any(|s| s == m.as_ref()))
    }
}

impl fmt::Display for MarkerSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}
