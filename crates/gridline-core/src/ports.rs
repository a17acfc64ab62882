//! Port traits.
//!
//! These traits define the boundaries between the matrix/job/build logic and
//! the external collaborators it drives (services, package installers, test
//! runners, artifact stores).

use crate::axis::ArtifactTag;
use crate::events::Event;
use crate::ids::*;
use crate::job::{GateResult, Job, JobReport, ServiceEndpoint};
use crate::report::{CoverageReport, TestReport};
use crate::selection::MarkerSelection;
use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `trigger.*.cancelled`, `trigger.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Starts and stops the external services a job needs.
#[async_trait]
pub trait ServiceProvisioner: Send + Sync {
    /// Start (or locate) `service` for `job` and wait until it is ready.
    async fn provision(&self, job: JobId, service: &str) -> Result<ServiceEndpoint>;

    /// Release a previously provisioned service.
    async fn release(&self, endpoint: &ServiceEndpoint) -> Result<()>;
}

/// Request to install a resolved dependency set.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub tag: ArtifactTag,
    pub runtime: String,
    /// Requirement lines; exact `name==version` pins when resolved against
    /// a package index.
    pub requirements: Vec<String>,
    pub system_packages: BTreeSet<String>,
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub matrix: BTreeMap<String, String>,
}

/// Installs dependencies into a job's environment.
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self, request: &InstallRequest) -> Result<()>;
}

/// One scoped test run.
#[derive(Debug, Clone)]
pub struct TestInvocation {
    pub tag: ArtifactTag,
    pub selection: MarkerSelection,
    pub workers: usize,
    /// Private writable copy of the test-data assets.
    pub workdir: PathBuf,
    pub env: BTreeMap<String, String>,
    pub matrix: BTreeMap<String, String>,
    pub report_path: PathBuf,
    pub coverage_path: PathBuf,
}

/// Runs the library's test suite.
#[async_trait]
pub trait TestExecutor: Send + Sync {
    /// Run the selected tests. `Err` means the run itself could not complete.
    async fn execute(&self, invocation: &TestInvocation) -> Result<TestReport>;
}

/// Checks that a backend module is importable after a build.
#[async_trait]
pub trait ModuleImporter: Send + Sync {
    async fn verify(&self, module: &str, env: &BTreeMap<String, String>) -> Result<()>;
}

/// Who an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactScope {
    Trigger(TriggerId),
    /// One job of a trigger. Jobs may share a tag (a primary and a
    /// min-version job, or extra axes), so the index keeps them apart.
    Job { trigger_id: TriggerId, index: usize },
    Build(BuildId),
}

impl ArtifactScope {
    /// The scope whose directory holds this one's artifacts.
    pub fn root(&self) -> ArtifactScope {
        match *self {
            ArtifactScope::Job { trigger_id, .. } => ArtifactScope::Trigger(trigger_id),
            other => other,
        }
    }
}

impl fmt::Display for ArtifactScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactScope::Trigger(id) => write!(f, "{}", id),
            ArtifactScope::Job { trigger_id, index } => write!(f, "{}/{}", trigger_id, index),
            ArtifactScope::Build(id) => write!(f, "{}", id),
        }
    }
}

/// Artifact store for reports and coverage.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn emit_report(&self, scope: ArtifactScope, report: &TestReport) -> Result<PathBuf>;

    async fn emit_coverage(&self, scope: ArtifactScope, coverage: &CoverageReport)
    -> Result<PathBuf>;

    /// Mark a trigger's artifacts as complete. Never called for cancelled
    /// triggers.
    async fn seal(&self, gate: &GateResult) -> Result<PathBuf>;
}

/// Runs one job to completion. Per-job failures are folded into the report.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn run(&self, job: Job) -> JobReport;
}
