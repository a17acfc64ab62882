//! Machine-readable test and coverage reports.

use crate::axis::ArtifactTag;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

/// Result of one test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub id: String,
    #[serde(default)]
    pub markers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub lane: usize,
    pub status: CaseStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Test report for one job or build acceptance check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub tag: ArtifactTag,
    /// Marker expression the run was scoped to.
    pub selection: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub cases: Vec<TestCaseResult>,
    /// Exit code of an external test command, when one was used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Set when the run did not complete (crash, timeout, executor error).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestReport {
    pub fn new(tag: ArtifactTag, selection: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            tag,
            selection: selection.into(),
            started_at: now,
            finished_at: now,
            cases: Vec::new(),
            exit_code: None,
            error: None,
        }
    }

    /// Report for a run that never produced results of its own.
    pub fn errored(
        tag: ArtifactTag,
        selection: impl Into<String>,
        started_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            error: Some(error.into()),
            ..Self::new(tag, selection)
        }
    }

    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary {
            total: self.cases.len(),
            ..Default::default()
        };
        for case in &self.cases {
            match case.status {
                CaseStatus::Passed => summary.passed += 1,
                CaseStatus::Failed => summary.failed += 1,
                CaseStatus::Skipped => summary.skipped += 1,
                CaseStatus::Error => summary.errors += 1,
            }
        }
        summary
    }

    /// A run passes when it completed, exited cleanly and no case failed.
    pub fn passed(&self) -> bool {
        let summary = self.summary();
        self.error.is_none()
            && self.exit_code.is_none_or(|code| code == 0)
            && summary.failed == 0
            && summary.errors == 0
    }

    /// Human-readable failure description, if the run did not pass.
    pub fn failure_reason(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        let summary = self.summary();
        if summary.failed > 0 || summary.errors > 0 {
            let failing: Vec<&str> = self
                .cases
                .iter()
                .filter(|c| matches!(c.status, CaseStatus::Failed | CaseStatus::Error))
                .map(|c| c.id.as_str())
                .collect();
            return Some(format!(
                "{} of {} tests failed: {}",
                failing.len(),
                summary.total,
                failing.join(", ")
            ));
        }
        match self.exit_code {
            Some(code) if code != 0 => Some(format!("test command exited with code {}", code)),
            _ => None,
        }
    }
}

/// Coverage data for one job or build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub tag: ArtifactTag,
    /// Raw coverage payload produced by the test command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CoverageReport {
    pub fn empty(tag: ArtifactTag, note: impl Into<String>) -> Self {
        Self {
            tag,
            data: None,
            note: Some(note.into()),
        }
    }
}
