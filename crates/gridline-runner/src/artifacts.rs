//! Filesystem artifact store.
//!
//! Layout:
//!
//! ```text
//! <root>/<trigger>/<index>-<backend>-<platform>-<runtime>/report.json
//! <root>/<trigger>/<index>-<backend>-<platform>-<runtime>/coverage.json
//! <root>/<trigger>/gate.json
//! <root>/<build>/<backend>-<platform>-<runtime>/report.json
//! ```
//!
//! A trigger directory without `gate.json` is incomplete: either still
//! running or cancelled. Consumers must not use its contents.

use async_trait::async_trait;
use gridline_core::Result;
use gridline_core::axis::ArtifactTag;
use gridline_core::ids::TriggerId;
use gridline_core::job::GateResult;
use gridline_core::ports::{ArtifactScope, ArtifactSink};
use gridline_core::report::{CoverageReport, TestReport};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const REPORT_FILE: &str = "report.json";
pub const COVERAGE_FILE: &str = "coverage.json";
pub const GATE_FILE: &str = "gate.json";

/// [`ArtifactSink`] writing JSON files under a root directory.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    root: PathBuf,
}

impl FsArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scope_dir(&self, scope: ArtifactScope) -> PathBuf {
        self.root.join(scope.root().to_string())
    }

    pub fn tag_dir(&self, scope: ArtifactScope, tag: &ArtifactTag) -> PathBuf {
        let name = match scope {
            ArtifactScope::Job { index, .. } => format!("{:03}-{}", index, tag),
            _ => tag.to_string(),
        };
        self.scope_dir(scope).join(name)
    }

    /// Whether a trigger's artifacts are complete and usable.
    pub fn is_sealed(&self, trigger_id: TriggerId) -> bool {
        self.scope_dir(ArtifactScope::Trigger(trigger_id))
            .join(GATE_FILE)
            .is_file()
    }

    async fn write_json<T: Serialize + Sync>(&self, path: PathBuf, value: &T) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(value)?;
        // Write then rename so readers never observe a half-written file.
        let tmp = path.with_extension("json.partial");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), "Artifact written");
        Ok(path)
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    async fn emit_report(&self, scope: ArtifactScope, report: &TestReport) -> Result<PathBuf> {
        let path = self.tag_dir(scope, &report.tag).join(REPORT_FILE);
        self.write_json(path, report).await
    }

    async fn emit_coverage(
        &self,
        scope: ArtifactScope,
        coverage: &CoverageReport,
    ) -> Result<PathBuf> {
        let path = self.tag_dir(scope, &coverage.tag).join(COVERAGE_FILE);
        self.write_json(path, coverage).await
    }

    async fn seal(&self, gate: &GateResult) -> Result<PathBuf> {
        let path = self
            .scope_dir(ArtifactScope::Trigger(gate.trigger_id))
            .join(GATE_FILE);
        self.write_json(path, gate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gridline_core::job::GateStatus;

    fn tag() -> ArtifactTag {
        ArtifactTag {
            backend: "postgres".into(),
            platform: "ubuntu-latest".into(),
            runtime: "3.10".into(),
        }
    }

    #[tokio::test]
    async fn test_report_layout() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsArtifactSink::new(dir.path());
        let trigger = TriggerId::new();
        let scope = ArtifactScope::Job {
            trigger_id: trigger,
            index: 7,
        };

        let report_path = sink
            .emit_report(scope, &TestReport::new(tag(), "postgres or core"))
            .await
            .unwrap();
        let coverage_path = sink
            .emit_coverage(scope, &CoverageReport::empty(tag(), "no data"))
            .await
            .unwrap();

        let expected = dir
            .path()
            .join(trigger.to_string())
            .join("007-postgres-ubuntu-latest-3.10");
        assert_eq!(report_path, expected.join(REPORT_FILE));
        assert_eq!(coverage_path, expected.join(COVERAGE_FILE));

        let parsed: TestReport =
            serde_json::from_slice(&std::fs::read(&report_path).unwrap()).unwrap();
        assert_eq!(parsed.tag, tag());
    }

    #[tokio::test]
    async fn test_jobs_sharing_a_tag_keep_separate_reports() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsArtifactSink::new(dir.path());
        let trigger = TriggerId::new();

        let primary = sink
            .emit_report(
                ArtifactScope::Job { trigger_id: trigger, index: 0 },
                &TestReport::new(tag(), "postgres or core"),
            )
            .await
            .unwrap();
        let min_version = sink
            .emit_report(
                ArtifactScope::Job { trigger_id: trigger, index: 1 },
                &TestReport::new(tag(), "postgres or core"),
            )
            .await
            .unwrap();

        assert_ne!(primary, min_version);
        assert!(primary.is_file());
        assert!(min_version.is_file());
        assert_eq!(primary.parent().unwrap().parent(), Some(sink.scope_dir(ArtifactScope::Trigger(trigger)).as_path()));
    }

    #[tokio::test]
    async fn test_seal_marks_trigger_complete() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FsArtifactSink::new(dir.path());
        let trigger = TriggerId::new();
        assert!(!sink.is_sealed(trigger));

        sink.emit_report(
            ArtifactScope::Trigger(trigger),
            &TestReport::new(tag(), "core"),
        )
        .await
        .unwrap();
        assert!(!sink.is_sealed(trigger));

        sink.seal(&GateResult {
            trigger_id: trigger,
            entries: vec![],
            aggregate: GateStatus::Pass,
            completed_at: Utc::now(),
        })
        .await
        .unwrap();
        assert!(sink.is_sealed(trigger));
    }
}
