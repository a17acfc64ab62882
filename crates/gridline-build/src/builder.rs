//! Package builds for a chosen backend subset.

use crate::importer::CommandImporter;
use chrono::Utc;
use futures::FutureExt;
use gridline_core::axis::{ArtifactTag, BackendDescriptor};
use gridline_core::build::{BuildArtifact, BuildSpec, CheckSummary, DependencyClosure};
use gridline_core::config::{MatrixConfig, Workers};
use gridline_core::events::{BuildCompletedPayload, Event};
use gridline_core::ids::BuildId;
use gridline_core::ports::{
    ArtifactScope, ArtifactSink, DependencyInstaller, EventBus, InstallRequest, ModuleImporter,
    TestExecutor, TestInvocation,
};
use gridline_core::report::{CoverageReport, TestReport};
use gridline_core::resolution::{Resolution, Resolver};
use gridline_core::selection::MarkerSelection;
use gridline_core::{Error, Result};
use gridline_runner::{CommandInstaller, CommandTestExecutor, StagedAssets, SuiteTestExecutor};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Host-specific inputs for a build.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Builds land in `<out_dir>/<build-id>/`.
    pub out_dir: PathBuf,
    /// Source tree the install command runs in.
    pub source_dir: PathBuf,
    pub platform: String,
    pub runtime: String,
    pub workers: Workers,
    pub env: BTreeMap<String, String>,
}

impl BuildSettings {
    pub fn new(out_dir: impl Into<PathBuf>, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            source_dir: source_dir.into(),
            platform: std::env::consts::OS.to_string(),
            runtime: "host".to_string(),
            workers: Workers::Auto,
            env: BTreeMap::new(),
        }
    }
}

pub struct PackageBuilder {
    config: Arc<MatrixConfig>,
    settings: BuildSettings,
    installer: Arc<dyn DependencyInstaller>,
    executor: Arc<dyn TestExecutor>,
    importer: Arc<dyn ModuleImporter>,
    sink: Arc<dyn ArtifactSink>,
    events: Option<Arc<dyn EventBus>>,
}

impl PackageBuilder {
    pub fn new(
        config: Arc<MatrixConfig>,
        settings: BuildSettings,
        installer: Arc<dyn DependencyInstaller>,
        executor: Arc<dyn TestExecutor>,
        importer: Arc<dyn ModuleImporter>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            config,
            settings,
            installer,
            executor,
            importer,
            sink,
            events: None,
        }
    }

    /// Builder using the configured install, test and import commands.
    pub fn from_config(
        config: Arc<MatrixConfig>,
        settings: BuildSettings,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        let commands = &config.commands;
        let timeout = commands.timeout_secs.map(Duration::from_secs);
        let installer = Arc::new(CommandInstaller::new(commands.install.clone(), timeout));
        let executor: Arc<dyn TestExecutor> = if config.suite.is_empty() {
            Arc::new(CommandTestExecutor::new(commands.test.clone(), timeout))
        } else {
            Arc::new(SuiteTestExecutor::new(config.suite.clone(), timeout))
        };
        let importer = Arc::new(CommandImporter::new(
            commands.import.clone(),
            settings.source_dir.clone(),
            timeout,
        ));
        Self::new(config.clone(), settings, installer, executor, importer, sink)
    }

    pub fn with_events(mut self, events: Arc<dyn EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the package for `spec`.
    ///
    /// Fails with [`Error::UnknownBackend`] before doing any work if a name
    /// has no descriptor, [`Error::Unsatisfiable`] if the merged closure cannot
    /// be resolved, [`Error::TestFailure`] if the acceptance check fails and
    /// [`Error::ImportVerification`] if a backend module does not import.
    pub async fn build(&self, spec: &BuildSpec) -> Result<BuildArtifact> {
        let names: Vec<&String> = spec.backends().iter().collect();
        let backends = self.config.select_backends(&names)?;
        let id = BuildId::new();

        info!(build = %id, backends = ?spec.backends(), check = spec.run_check(), "Build started");

        let result = self.run(id, spec, &backends).await;

        let (succeeded, error) = match &result {
            Ok(artifact) => {
                info!(build = %id, path = %artifact.path.display(), "Build accepted");
                (true, None)
            }
            Err(e) => {
                warn!(build = %id, error = %e, "Build rejected");
                (false, Some(e.to_string()))
            }
        };
        if let Some(events) = &self.events {
            let event = Event::BuildCompleted(BuildCompletedPayload {
                build_id: id,
                backends: spec.backends().clone(),
                succeeded,
                error,
                completed_at: Utc::now(),
            });
            if let Err(e) = events.publish(event).await {
                warn!(build = %id, error = %e, "Failed to publish build event");
            }
        }

        result
    }

    async fn run(
        &self,
        id: BuildId,
        spec: &BuildSpec,
        backends: &[&BackendDescriptor],
    ) -> Result<BuildArtifact> {
        let closure = DependencyClosure::derive(&self.config.base_dependencies, backends.iter().copied());
        for applied in &closure.overrides {
            info!(
                build = %id,
                backend = %applied.backend,
                replaced = %applied.replaced,
                replacement = %applied.replacement,
                "Dependency substituted"
            );
        }

        let resolver = Resolver::new(&self.config.package_index);
        let resolution = if self.config.package_index.is_empty() {
            Resolution::default()
        } else {
            resolver.resolve(&closure.requirements, &[])?
        };
        let lines = resolver.requirement_lines(&closure.requirements, &[])?;

        let path = self.settings.out_dir.join(id.to_string());
        tokio::fs::create_dir_all(&path).await?;

        let tag = self.tag(spec);
        let request = InstallRequest {
            tag: tag.clone(),
            runtime: self.settings.runtime.clone(),
            requirements: lines.clone(),
            system_packages: backends
                .iter()
                .flat_map(|b| b.system_packages.iter().cloned())
                .collect(),
            workdir: self.settings.source_dir.clone(),
            env: self.settings.env.clone(),
            matrix: self.matrix(spec),
        };
        self.installer
            .install(&request)
            .await
            .map_err(|e| Error::Build(format!("dependency installation failed: {}", e)))?;

        let check = if spec.run_check() {
            Some(self.check(id, &tag, backends).await?)
        } else {
            None
        };

        let verified_modules = self.verify_imports(id, backends).await?;

        let artifact = BuildArtifact {
            id,
            path,
            backends: spec.backends().clone(),
            requirements: closure.requirements,
            resolution,
            overrides: closure.overrides,
            check,
            verified_modules,
            closure_digest: closure_digest(&lines),
            created_at: Utc::now(),
        };

        let manifest = serde_json::to_vec_pretty(&artifact)?;
        tokio::fs::write(artifact.manifest_path(), manifest).await?;
        Ok(artifact)
    }

    /// Run the acceptance check: every selected backend's tests or core tests.
    async fn check(
        &self,
        id: BuildId,
        tag: &ArtifactTag,
        backends: &[&BackendDescriptor],
    ) -> Result<CheckSummary> {
        let selection = MarkerSelection::for_build(backends.iter().map(|b| b.marker()));
        let staged = StagedAssets::stage(self.config.assets.as_deref())
            .map_err(|e| Error::Build(format!("failed to stage assets: {}", e)))?;
        let outputs = staged.output_dir()?;

        let invocation = TestInvocation {
            tag: tag.clone(),
            selection: selection.clone(),
            workers: self.settings.workers.resolve(),
            workdir: staged.path().to_path_buf(),
            env: self.settings.env.clone(),
            matrix: BTreeMap::new(),
            report_path: outputs.join("report.xml"),
            coverage_path: outputs.join("coverage.json"),
        };

        info!(build = %id, selection = %selection, "Running acceptance check");
        let started_at = Utc::now();
        let report = match AssertUnwindSafe(self.executor.execute(&invocation))
            .catch_unwind()
            .await
        {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => TestReport::errored(tag.clone(), selection.expression(), started_at, e.to_string()),
            Err(_) => TestReport::errored(
                tag.clone(),
                selection.expression(),
                started_at,
                "test executor panicked",
            ),
        };

        let scope = ArtifactScope::Build(id);
        if let Err(e) = self.sink.emit_report(scope, &report).await {
            warn!(build = %id, error = %e, "Failed to emit test report");
        }
        let coverage = match tokio::fs::read(&invocation.coverage_path).await {
            Ok(bytes) => CoverageReport {
                tag: tag.clone(),
                data: serde_json::from_slice(&bytes).ok(),
                note: None,
            },
            Err(_) => CoverageReport::empty(tag.clone(), "no coverage data produced"),
        };
        if let Err(e) = self.sink.emit_coverage(scope, &coverage).await {
            warn!(build = %id, error = %e, "Failed to emit coverage report");
        }

        if let Some(reason) = report.failure_reason() {
            return Err(Error::TestFailure(format!(
                "acceptance check '{}' failed: {}",
                selection, reason
            )));
        }

        let summary = report.summary();
        Ok(CheckSummary {
            selection: selection.expression(),
            passed: true,
            total: summary.total,
            failed: summary.failed + summary.errors,
        })
    }

    async fn verify_imports(
        &self,
        id: BuildId,
        backends: &[&BackendDescriptor],
    ) -> Result<BTreeSet<String>> {
        let mut verified = BTreeSet::new();
        let mut broken = Vec::new();

        for backend in backends {
            let module = backend.module(&self.config.package);
            match self.importer.verify(&module, &self.settings.env).await {
                Ok(()) => {
                    verified.insert(module);
                }
                Err(e) => {
                    warn!(build = %id, backend = %backend.name, module = %module, error = %e, "Backend module failed to import");
                    broken.push(module);
                }
            }
        }

        if broken.is_empty() {
            Ok(verified)
        } else {
            Err(Error::ImportVerification { modules: broken })
        }
    }

    fn tag(&self, spec: &BuildSpec) -> ArtifactTag {
        ArtifactTag {
            backend: spec
                .backends()
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join("+"),
            platform: self.settings.platform.clone(),
            runtime: self.settings.runtime.clone(),
        }
    }

    fn matrix(&self, spec: &BuildSpec) -> BTreeMap<String, String> {
        let tag = self.tag(spec);
        BTreeMap::from([
            (self.config.backend_axis.clone(), tag.backend),
            (self.config.platform_axis.clone(), tag.platform),
            (self.config.runtime_axis.clone(), tag.runtime),
        ])
    }
}

fn closure_digest(lines: &[String]) -> String {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_digest_is_order_sensitive() {
        let a = closure_digest(&["duckdb==0.3.2".into(), "pandas==1.4.1".into()]);
        let b = closure_digest(&["pandas==1.4.1".into(), "duckdb==0.3.2".into()]);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
