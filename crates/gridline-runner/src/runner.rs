//! The job lifecycle: provision, install, stage, test, report.

use crate::executor::{CommandTestExecutor, SuiteTestExecutor};
use crate::install::CommandInstaller;
use crate::services::ServiceLease;
use crate::staging::StagedAssets;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use gridline_core::build::DependencyClosure;
use gridline_core::config::{MatrixConfig, Workers};
use gridline_core::job::{Job, JobOutcome, JobReport, JobState};
use gridline_core::ports::{
    ArtifactScope, ArtifactSink, DependencyInstaller, InstallRequest, JobExecutor,
    ServiceProvisioner, TestExecutor, TestInvocation,
};
use gridline_core::report::{CoverageReport, TestReport};
use gridline_core::resolution::{PackageIndex, Requirement, Resolver};
use gridline_core::selection::MarkerSelection;
use gridline_core::{Error, Result};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{info, warn};

/// Static inputs shared by every job.
#[derive(Debug, Clone, Default)]
pub struct RunnerSettings {
    pub assets: Option<PathBuf>,
    pub workers: Workers,
    pub base_dependencies: Vec<Requirement>,
    pub package_index: PackageIndex,
    /// Extra environment for install and test steps.
    pub env: BTreeMap<String, String>,
}

impl RunnerSettings {
    pub fn from_config(config: &MatrixConfig) -> Self {
        Self {
            assets: config.assets.clone(),
            workers: config.workers,
            base_dependencies: config.base_dependencies.clone(),
            package_index: config.package_index.clone(),
            env: BTreeMap::new(),
        }
    }
}

/// Runs one job through every step. Step failures are folded into the
/// outcome; report and coverage emission is attempted on every path.
pub struct JobRunner {
    settings: RunnerSettings,
    provisioner: Arc<dyn ServiceProvisioner>,
    installer: Arc<dyn DependencyInstaller>,
    executor: Arc<dyn TestExecutor>,
    sink: Arc<dyn ArtifactSink>,
}

/// Everything the test step needs once setup succeeded.
struct Prepared {
    // Held until the job ends; the installed environment lives here.
    _install_dir: TempDir,
    staged: StagedAssets,
    env: BTreeMap<String, String>,
}

/// Environment variable naming the job's private install directory.
pub const INSTALL_DIR_ENV: &str = "GRIDLINE_INSTALL_DIR";

impl JobRunner {
    pub fn new(
        settings: RunnerSettings,
        provisioner: Arc<dyn ServiceProvisioner>,
        installer: Arc<dyn DependencyInstaller>,
        executor: Arc<dyn TestExecutor>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            settings,
            provisioner,
            installer,
            executor,
            sink,
        }
    }

    /// Wire a runner from configuration using command-based collaborators.
    /// The built-in suite executor is used when the config declares cases.
    pub fn from_config(
        config: &MatrixConfig,
        provisioner: Arc<dyn ServiceProvisioner>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        let timeout = config.commands.timeout_secs.map(Duration::from_secs);
        let installer = Arc::new(CommandInstaller::new(config.commands.install.clone(), timeout));
        let executor: Arc<dyn TestExecutor> = if config.suite.is_empty() {
            Arc::new(CommandTestExecutor::new(config.commands.test.clone(), timeout))
        } else {
            Arc::new(SuiteTestExecutor::new(config.suite.clone(), timeout))
        };
        Self::new(
            RunnerSettings::from_config(config),
            provisioner,
            installer,
            executor,
            sink,
        )
    }

    /// Run `job` to completion.
    pub async fn run(&self, mut job: Job) -> JobReport {
        let started_at = Utc::now();
        let tag = job.tag().clone();
        let selection = MarkerSelection::for_job(job.combination.backend().marker());

        info!(job = %job.id, trigger = %job.trigger_id, combination = %job.combination.display_name(), "Job started");

        let mut lease = ServiceLease::new(self.provisioner.clone());
        let prepared = self.prepare(&mut job, &mut lease).await;

        let (outcome, report, coverage) = match prepared {
            Ok(prepared) => {
                job.transition(JobState::Testing);
                let (report, coverage) = self.test(&job, &selection, &prepared, started_at).await;
                let outcome = match report.failure_reason() {
                    None => JobOutcome::Passed,
                    Some(reason) => JobOutcome::Failed { reason },
                };
                (outcome, report, coverage)
            }
            Err(Error::Infrastructure { step, message }) => {
                let report = TestReport::errored(
                    tag.clone(),
                    selection.expression(),
                    started_at,
                    format!("{} failed: {}", step, message),
                );
                let coverage = CoverageReport::empty(tag.clone(), "tests did not run");
                (JobOutcome::InfrastructureError { step, message }, report, coverage)
            }
            Err(e) => {
                let message = e.to_string();
                let report = TestReport::errored(tag.clone(), selection.expression(), started_at, &message);
                let coverage = CoverageReport::empty(tag.clone(), "tests did not run");
                let outcome = JobOutcome::InfrastructureError {
                    step: "setup".to_string(),
                    message,
                };
                (outcome, report, coverage)
            }
        };

        job.transition(JobState::Reporting);
        let artifacts = self.emit(&job, &report, &coverage).await;

        lease.release().await;
        job.transition(JobState::Finished);

        let finished_at = Utc::now();
        info!(
            job = %job.id,
            outcome = %outcome,
            duration_ms = (finished_at - started_at).num_milliseconds(),
            "Job finished"
        );

        JobReport {
            job_id: job.id,
            trigger_id: job.trigger_id,
            index: job.index,
            name: job.combination.display_name(),
            tag,
            outcome,
            artifacts,
            started_at,
            finished_at,
        }
    }

    /// Provision, install, stage. Any error here is an infrastructure error.
    async fn prepare(&self, job: &mut Job, lease: &mut ServiceLease) -> Result<Prepared> {
        let combination = job.combination.clone();
        let backend = combination.backend();

        job.transition(JobState::Provisioning);
        for service in &backend.required_services {
            let endpoint = self
                .provisioner
                .provision(job.id, service)
                .await
                .map_err(|e| as_infrastructure("provision", e))?;
            lease.push(endpoint);
        }
        job.services = lease.endpoints().to_vec();

        let install_dir = tempfile::Builder::new()
            .prefix("gridline-install-")
            .tempdir()
            .map_err(|e| as_infrastructure("install", e.into()))?;

        let mut env = self.settings.env.clone();
        env.extend(job.service_env());
        env.insert(
            INSTALL_DIR_ENV.to_string(),
            install_dir.path().display().to_string(),
        );

        job.transition(JobState::Installing);
        let closure = DependencyClosure::derive(&self.settings.base_dependencies, [backend]);
        let requirements = Resolver::new(&self.settings.package_index)
            .requirement_lines(&closure.requirements, combination.overrides())
            .map_err(|e| as_infrastructure("install", e))?;
        let request = InstallRequest {
            tag: combination.tag().clone(),
            runtime: combination.tag().runtime.clone(),
            requirements,
            system_packages: backend.system_packages.clone(),
            workdir: install_dir.path().to_path_buf(),
            env: env.clone(),
            matrix: matrix_values(job),
        };
        self.installer
            .install(&request)
            .await
            .map_err(|e| as_infrastructure("install", e))?;

        job.transition(JobState::Staging);
        let staged = StagedAssets::stage(self.settings.assets.as_deref())
            .map_err(|e| as_infrastructure("stage", e))?;

        Ok(Prepared {
            _install_dir: install_dir,
            staged,
            env,
        })
    }

    /// Step 4. Failures of any kind, including a panicking executor, become a
    /// failed report rather than escaping.
    async fn test(
        &self,
        job: &Job,
        selection: &MarkerSelection,
        prepared: &Prepared,
        started_at: DateTime<Utc>,
    ) -> (TestReport, CoverageReport) {
        let tag = job.tag().clone();
        let outputs = match prepared.staged.output_dir() {
            Ok(dir) => dir,
            Err(_) => prepared.staged.path().to_path_buf(),
        };
        let coverage_path = outputs.join("coverage.json");

        let invocation = TestInvocation {
            tag: tag.clone(),
            selection: selection.clone(),
            workers: self.settings.workers.resolve(),
            workdir: prepared.staged.path().to_path_buf(),
            env: prepared.env.clone(),
            matrix: matrix_values(job),
            report_path: outputs.join("report.xml"),
            coverage_path: coverage_path.clone(),
        };

        let run = AssertUnwindSafe(self.executor.execute(&invocation))
            .catch_unwind()
            .await;

        let report = match run {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                warn!(job = %job.id, error = %e, "Test run did not complete");
                TestReport::errored(tag, selection.expression(), started_at, e.to_string())
            }
            Err(_) => {
                warn!(job = %job.id, "Test executor panicked");
                TestReport::errored(tag, selection.expression(), started_at, "test executor panicked")
            }
        };
        let coverage = read_coverage(job, &coverage_path).await;
        (report, coverage)
    }

    /// Step 5. Best effort; failures are logged, never propagated.
    async fn emit(&self, job: &Job, report: &TestReport, coverage: &CoverageReport) -> Vec<PathBuf> {
        let scope = ArtifactScope::Job {
            trigger_id: job.trigger_id,
            index: job.index,
        };
        let mut artifacts = Vec::new();

        match self.sink.emit_report(scope, report).await {
            Ok(path) => artifacts.push(path),
            Err(e) => warn!(job = %job.id, error = %e, "Failed to emit test report"),
        }

        match self.sink.emit_coverage(scope, coverage).await {
            Ok(path) => artifacts.push(path),
            Err(e) => warn!(job = %job.id, error = %e, "Failed to emit coverage report"),
        }

        artifacts
    }
}

#[async_trait]
impl JobExecutor for JobRunner {
    async fn run(&self, job: Job) -> JobReport {
        JobRunner::run(self, job).await
    }
}

fn matrix_values(job: &Job) -> BTreeMap<String, String> {
    job.combination
        .assignments()
        .iter()
        .map(|a| (a.axis.clone(), a.value.clone()))
        .collect()
}

fn as_infrastructure(step: &str, error: Error) -> Error {
    match error {
        Error::Infrastructure { .. } => error,
        other => Error::infrastructure(step, other.to_string()),
    }
}

async fn read_coverage(job: &Job, path: &Path) -> CoverageReport {
    let tag = job.tag().clone();
    match tokio::fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(data) => CoverageReport {
                tag,
                data: Some(data),
                note: None,
            },
            Err(e) => CoverageReport::empty(tag, format!("unreadable coverage data: {}", e)),
        },
        Err(_) => CoverageReport::empty(tag, "no coverage data produced"),
    }
}
