//! Test executors: an external test command, or the built-in suite.

use crate::command::{CommandSpec, run_command, shell_quote};
use crate::lanes::{Lane, plan_lanes};
use async_trait::async_trait;
use chrono::Utc;
use gridline_core::config::SuiteCase;
use gridline_core::interpolation::TemplateContext;
use gridline_core::ports::{TestExecutor, TestInvocation};
use gridline_core::report::{CaseStatus, TestCaseResult, TestReport};
use gridline_core::{Error, Result};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info};

fn template_context(invocation: &TestInvocation) -> TemplateContext {
    TemplateContext {
        variables: [
            ("markers", invocation.selection.expression()),
            ("workers", invocation.workers.to_string()),
            (
                "report",
                shell_quote(&invocation.report_path.display().to_string()),
            ),
            (
                "coverage",
                shell_quote(&invocation.coverage_path.display().to_string()),
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect(),
        matrix: invocation.matrix.clone(),
        env: invocation.env.clone(),
    }
}

/// Runs the configured test command once for the whole selection, e.g.
/// `pytest -m '${{ markers }}' -n ${{ workers }} --dist loadgroup`.
pub struct CommandTestExecutor {
    template: String,
    timeout: Option<Duration>,
}

impl CommandTestExecutor {
    pub fn new(template: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            template: template.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TestExecutor for CommandTestExecutor {
    async fn execute(&self, invocation: &TestInvocation) -> Result<TestReport> {
        let started_at = Utc::now();
        let command = template_context(invocation).interpolate(&self.template);

        info!(tag = %invocation.tag, selection = %invocation.selection, "Running test command");

        let spec = CommandSpec::new(command, &invocation.workdir)
            .env(&invocation.env)
            .timeout(self.timeout);
        let output = run_command(&spec).await?;

        let mut report = TestReport::new(invocation.tag.clone(), invocation.selection.expression());
        report.started_at = started_at;
        report.finished_at = Utc::now();
        report.exit_code = Some(output.exit_code);
        Ok(report)
    }
}

/// Runs a declared list of cases across lanes.
pub struct SuiteTestExecutor {
    cases: Vec<SuiteCase>,
    default_timeout: Option<Duration>,
}

impl SuiteTestExecutor {
    pub fn new(cases: Vec<SuiteCase>, default_timeout: Option<Duration>) -> Self {
        Self {
            cases,
            default_timeout,
        }
    }
}

#[async_trait]
impl TestExecutor for SuiteTestExecutor {
    async fn execute(&self, invocation: &TestInvocation) -> Result<TestReport> {
        let started_at = Utc::now();
        let selected: Vec<SuiteCase> = self
            .cases
            .iter()
            .filter(|c| invocation.selection.matches(&c.markers))
            .cloned()
            .collect();
        let order: Vec<String> = selected.iter().map(|c| c.id.clone()).collect();
        let lanes = plan_lanes(&selected, invocation.workers);

        info!(
            tag = %invocation.tag,
            selection = %invocation.selection,
            selected = selected.len(),
            declared = self.cases.len(),
            lanes = lanes.len(),
            "Running test suite"
        );

        let mut set = JoinSet::new();
        for lane in lanes {
            set.spawn(run_lane(
                lane,
                invocation.clone(),
                template_context(invocation),
                self.default_timeout,
            ));
        }

        let mut results = Vec::with_capacity(order.len());
        while let Some(joined) = set.join_next().await {
            let lane_results =
                joined.map_err(|e| Error::Internal(format!("Test lane failed: {}", e)))?;
            results.extend(lane_results);
        }
        results.sort_by_key(|r: &TestCaseResult| order.iter().position(|id| *id == r.id));

        let mut report = TestReport::new(invocation.tag.clone(), invocation.selection.expression());
        report.started_at = started_at;
        report.finished_at = Utc::now();
        report.cases = results;
        Ok(report)
    }
}

async fn run_lane(
    lane: Lane,
    invocation: TestInvocation,
    ctx: TemplateContext,
    default_timeout: Option<Duration>,
) -> Vec<TestCaseResult> {
    let mut env = invocation.env.clone();
    env.insert("GRIDLINE_LANE".to_string(), lane.index.to_string());
    env.insert("GRIDLINE_MARKERS".to_string(), invocation.selection.expression());

    let mut results = Vec::with_capacity(lane.cases.len());
    for case in lane.cases {
        let command = ctx.interpolate(&case.command);
        let timeout = case.timeout_secs.map(Duration::from_secs).or(default_timeout);
        let spec = CommandSpec::new(command, &invocation.workdir)
            .env(&env)
            .timeout(timeout);

        let (status, duration_ms, message) = match run_command(&spec).await {
            Ok(output) if output.success() => (CaseStatus::Passed, output.duration_ms, None),
            Ok(output) => (
                CaseStatus::Failed,
                output.duration_ms,
                Some(format!("exit code {}: {}", output.exit_code, output.summary())),
            ),
            Err(e) => (CaseStatus::Error, 0, Some(e.to_string())),
        };

        debug!(case = %case.id, lane = lane.index, ?status, "Test case finished");

        results.push(TestCaseResult {
            id: case.id,
            markers: case.markers,
            group: case.group,
            lane: lane.index,
            status,
            duration_ms,
            message,
        });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridline_core::axis::ArtifactTag;
    use gridline_core::selection::MarkerSelection;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn invocation(workdir: &Path, selection: MarkerSelection, workers: usize) -> TestInvocation {
        TestInvocation {
            tag: ArtifactTag {
                backend: "sqlite".into(),
                platform: "ubuntu-latest".into(),
                runtime: "3.10".into(),
            },
            selection,
            workers,
            workdir: workdir.to_path_buf(),
            env: BTreeMap::new(),
            matrix: BTreeMap::from([("runtime".to_string(), "3.10".to_string())]),
            report_path: workdir.join("report.xml"),
            coverage_path: workdir.join("coverage.json"),
        }
    }

    fn case(id: &str, command: &str, markers: &[&str], group: Option<&str>) -> SuiteCase {
        SuiteCase {
            id: id.into(),
            command: command.into(),
            markers: markers.iter().map(|m| m.to_string()).collect(),
            group: group.map(String::from),
            timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn test_command_executor_interpolates_markers() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandTestExecutor::new(
            "echo '${{ markers }}' -n ${{ workers }} py${{ matrix.runtime }} > ${{ report }}",
            None,
        );
        let report = executor
            .execute(&invocation(dir.path(), MarkerSelection::for_build(["x", "y"]), 2))
            .await
            .unwrap();

        assert!(report.passed());
        let written = std::fs::read_to_string(dir.path().join("report.xml")).unwrap();
        assert_eq!(written.trim(), "x or y or core -n 2 py3.10");
    }

    #[tokio::test]
    async fn test_command_executor_nonzero_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let executor = CommandTestExecutor::new("exit 1", None);
        let report = executor
            .execute(&invocation(dir.path(), MarkerSelection::for_job("sqlite"), 1))
            .await
            .unwrap();
        assert!(!report.passed());
        assert_eq!(report.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_suite_runs_disjunctive_selection() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SuiteTestExecutor::new(
            vec![
                case("x_only", "true", &["x"], None),
                case("y_only", "true", &["y"], None),
                case("core", "true", &["core"], None),
                case("z_only", "true", &["z"], None),
            ],
            None,
        );
        let report = executor
            .execute(&invocation(dir.path(), MarkerSelection::for_build(["x", "y"]), 2))
            .await
            .unwrap();

        let ids: Vec<&str> = report.cases.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["x_only", "y_only", "core"]);
        assert!(report.passed());
    }

    #[tokio::test]
    async fn test_suite_reports_failures() {
        let dir = tempfile::tempdir().unwrap();
        let executor = SuiteTestExecutor::new(
            vec![
                case("ok", "true", &["core"], None),
                case("bad", "echo nope >&2; exit 1", &["core"], None),
            ],
            None,
        );
        let report = executor
            .execute(&invocation(dir.path(), MarkerSelection::for_job("sqlite"), 4))
            .await
            .unwrap();

        assert!(!report.passed());
        let bad = report.cases.iter().find(|c| c.id == "bad").unwrap();
        assert_eq!(bad.status, CaseStatus::Failed);
        assert!(bad.message.as_deref().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_grouped_cases_do_not_race() {
        let dir = tempfile::tempdir().unwrap();
        // Each case appends to a shared file, then checks it is the only writer.
        let command = "echo $GRIDLINE_LANE >> lanes.txt; sleep 0.05; test $(sort -u lanes.txt | wc -l) -eq 1";
        let executor = SuiteTestExecutor::new(
            (0..4)
                .map(|i| case(&format!("t{}", i), command, &["core"], Some("shared_conn")))
                .collect(),
            None,
        );
        let report = executor
            .execute(&invocation(dir.path(), MarkerSelection::for_job("sqlite"), 4))
            .await
            .unwrap();

        assert!(report.passed());
        let lanes: std::collections::BTreeSet<usize> = report.cases.iter().map(|c| c.lane).collect();
        assert_eq!(lanes.len(), 1);
    }
}
