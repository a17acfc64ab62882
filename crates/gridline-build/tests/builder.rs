//! PackageBuilder behavior with in-memory collaborators.

use async_trait::async_trait;
use futures::StreamExt;
use gridline_build::{BuildSettings, PackageBuilder};
use gridline_core::build::{BuildArtifact, BuildSpec};
use gridline_core::config::MatrixConfig;
use gridline_core::events::Event;
use gridline_core::job::GateResult;
use gridline_core::ports::{
    ArtifactScope, ArtifactSink, DependencyInstaller, EventBus, InstallRequest, ModuleImporter,
    TestExecutor, TestInvocation,
};
use gridline_core::report::{CaseStatus, CoverageReport, TestCaseResult, TestReport};
use gridline_core::{Error, ErrorKind, Result};
use gridline_scheduler::InMemoryEventBus;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

const CONFIG: &str = r#"
package: ibis
axes:
  - name: os
    values: [ubuntu-latest]
  - name: runtime
    values: ["3.10"]
  - name: backend
    values: [duckdb, sqlite, postgres]
backends:
  - name: duckdb
    dependencies: ["duckdb>=0.3", "pyarrow>=1.0"]
  - name: sqlite
    marker: sqlite
  - name: postgres
    dependencies: ["psycopg2>=2.8"]
    overrides:
      - package: psycopg2
        replacement: "psycopg2-binary>=2.8"
base_dependencies: ["pandas>=1.2", "pyarrow>=0.9"]
package_index:
  pandas: ["1.2.0", "1.4.1"]
  duckdb: ["0.3.2", "0.4.0"]
  pyarrow: ["0.9", "1.0", "6.0"]
  psycopg2-binary: ["2.8.6", "2.9.3"]
"#;

#[derive(Default)]
struct RecordingInstaller {
    requests: Mutex<Vec<InstallRequest>>,
}

#[async_trait]
impl DependencyInstaller for RecordingInstaller {
    async fn install(&self, request: &InstallRequest) -> Result<()> {
        self.requests.lock().await.push(request.clone());
        Ok(())
    }
}

/// Runs a fixed suite of tagged cases, honoring the selection.
struct TaggedSuite {
    cases: Vec<(&'static str, &'static str, bool)>,
    invocations: Mutex<Vec<TestInvocation>>,
}

impl TaggedSuite {
    fn new(cases: Vec<(&'static str, &'static str, bool)>) -> Self {
        Self {
            cases,
            invocations: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TestExecutor for TaggedSuite {
    async fn execute(&self, invocation: &TestInvocation) -> Result<TestReport> {
        self.invocations.lock().await.push(invocation.clone());
        let mut report = TestReport::new(invocation.tag.clone(), invocation.selection.expression());
        for (id, marker, passes) in &self.cases {
            if !invocation.selection.matches(&[*marker]) {
                continue;
            }
            report.cases.push(TestCaseResult {
                id: id.to_string(),
                markers: vec![marker.to_string()],
                group: None,
                lane: 0,
                status: if *passes {
                    CaseStatus::Passed
                } else {
                    CaseStatus::Failed
                },
                duration_ms: 1,
                message: None,
            });
        }
        Ok(report)
    }
}

struct FakeImporter {
    broken: Vec<&'static str>,
}

#[async_trait]
impl ModuleImporter for FakeImporter {
    async fn verify(&self, module: &str, _env: &BTreeMap<String, String>) -> Result<()> {
        if self.broken.contains(&module) {
            Err(Error::ImportVerification {
                modules: vec![module.to_string()],
            })
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    scopes: Mutex<Vec<ArtifactScope>>,
}

#[async_trait]
impl ArtifactSink for RecordingSink {
    async fn emit_report(&self, scope: ArtifactScope, _report: &TestReport) -> Result<PathBuf> {
        self.scopes.lock().await.push(scope);
        Ok(PathBuf::from("report.json"))
    }

    async fn emit_coverage(&self, _scope: ArtifactScope, _coverage: &CoverageReport) -> Result<PathBuf> {
        Ok(PathBuf::from("coverage.json"))
    }

    async fn seal(&self, _gate: &GateResult) -> Result<PathBuf> {
        Ok(PathBuf::from("gate.json"))
    }
}

struct Harness {
    _out: tempfile::TempDir,
    installer: Arc<RecordingInstaller>,
    suite: Arc<TaggedSuite>,
    sink: Arc<RecordingSink>,
    builder: PackageBuilder,
}

fn harness(config: &str, suite: TaggedSuite, broken: Vec<&'static str>) -> Harness {
    let out = tempfile::tempdir().unwrap();
    let config = Arc::new(MatrixConfig::from_yaml(config).unwrap());
    let installer = Arc::new(RecordingInstaller::default());
    let suite = Arc::new(suite);
    let sink = Arc::new(RecordingSink::default());
    let builder = PackageBuilder::new(
        config,
        BuildSettings::new(out.path(), out.path()),
        installer.clone(),
        suite.clone(),
        Arc::new(FakeImporter { broken }),
        sink.clone(),
    );
    Harness {
        _out: out,
        installer,
        suite,
        sink,
        builder,
    }
}

fn default_suite() -> TaggedSuite {
    TaggedSuite::new(vec![
        ("test_duckdb_only", "duckdb", true),
        ("test_sqlite_only", "sqlite", true),
        ("test_postgres_only", "postgres", false),
        ("test_core", "core", true),
    ])
}

#[tokio::test]
async fn test_check_runs_disjunctive_selection() {
    let h = harness(CONFIG, default_suite(), vec![]);
    let spec = BuildSpec::new(["duckdb", "sqlite"], true).unwrap();

    let artifact = h.builder.build(&spec).await.unwrap();

    let invocations = h.suite.invocations.lock().await;
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].selection.expression(), "duckdb or sqlite or core");

    let check = artifact.check.unwrap();
    assert!(check.passed);
    // Union of both backends plus core; the failing postgres case is out of scope.
    assert_eq!(check.total, 3);
    assert_eq!(*h.sink.scopes.lock().await, vec![ArtifactScope::Build(artifact.id)]);
}

#[tokio::test]
async fn test_artifact_carries_closure_and_modules() {
    let h = harness(CONFIG, default_suite(), vec![]);
    let spec = BuildSpec::new(["duckdb", "postgres"], false).unwrap();

    let artifact = h.builder.build(&spec).await.unwrap();

    assert!(artifact.check.is_none());
    assert!(h.suite.invocations.lock().await.is_empty());

    let requested = &h.installer.requests.lock().await[0].requirements;
    assert_eq!(
        requested,
        &vec![
            "duckdb==0.4.0",
            "pandas==1.4.1",
            "psycopg2-binary==2.9.3",
            "pyarrow==6.0.0"
        ]
    );
    assert_eq!(artifact.overrides.len(), 1);
    assert_eq!(artifact.overrides[0].replaced, "psycopg2");
    assert_eq!(
        artifact.verified_modules.iter().map(String::as_str).collect::<Vec<_>>(),
        vec!["ibis.backends.duckdb", "ibis.backends.postgres"]
    );

    let manifest: BuildArtifact =
        serde_json::from_slice(&std::fs::read(artifact.manifest_path()).unwrap()).unwrap();
    assert_eq!(manifest, artifact);
}

#[tokio::test]
async fn test_failed_check_rejects_build() {
    let h = harness(CONFIG, default_suite(), vec![]);
    let spec = BuildSpec::new(["postgres"], true).unwrap();

    let err = h.builder.build(&spec).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TestFailure);
    assert!(err.to_string().contains("test_postgres_only"));
}

#[tokio::test]
async fn test_unsatisfiable_closure_is_build_error() {
    let config = CONFIG.replace(r#"duckdb: ["0.3.2", "0.4.0"]"#, r#"duckdb: ["0.2.0"]"#);
    let h = harness(&config, default_suite(), vec![]);
    let spec = BuildSpec::new(["duckdb"], true).unwrap();

    let err = h.builder.build(&spec).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Build);
    assert!(matches!(err, Error::Unsatisfiable { ref package, .. } if package == "duckdb"));
    assert!(h.installer.requests.lock().await.is_empty());
}

#[tokio::test]
async fn test_broken_module_is_import_verification_error() {
    let h = harness(CONFIG, default_suite(), vec!["ibis.backends.sqlite"]);
    let spec = BuildSpec::new(["duckdb", "sqlite"], true).unwrap();

    let err = h.builder.build(&spec).await.unwrap_err();

    match err {
        Error::ImportVerification { modules } => {
            assert_eq!(modules, vec!["ibis.backends.sqlite"]);
        }
        other => panic!("expected import verification error, got {:?}", other),
    }
    // The check itself ran and passed before verification.
    assert_eq!(h.suite.invocations.lock().await.len(), 1);
}

#[tokio::test]
async fn test_unknown_backend_fails_before_work() {
    let h = harness(CONFIG, default_suite(), vec![]);
    let spec = BuildSpec::new(["duckdb", "oracle"], true).unwrap();

    let err = h.builder.build(&spec).await.unwrap_err();

    assert!(matches!(err, Error::UnknownBackend(ref name) if name == "oracle"));
    assert!(h.installer.requests.lock().await.is_empty());
}

#[tokio::test]
async fn test_build_completion_is_published() {
    let bus = Arc::new(InMemoryEventBus::default());
    let mut events = bus.subscribe("build.completed.>").await.unwrap();

    let h = harness(CONFIG, default_suite(), vec![]);
    let builder = h.builder.with_events(bus.clone());
    let artifact = builder
        .build(&BuildSpec::new(["sqlite"], false).unwrap())
        .await
        .unwrap();

    match events.next().await {
        Some(Ok(Event::BuildCompleted(payload))) => {
            assert_eq!(payload.build_id, artifact.id);
            assert!(payload.succeeded);
        }
        other => panic!("expected build event, got {:?}", other),
    }
}
