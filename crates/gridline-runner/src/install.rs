//! Dependency installation through a command template.

use crate::command::{CommandSpec, run_command, shell_quote};
use async_trait::async_trait;
use gridline_core::interpolation::TemplateContext;
use gridline_core::ports::{DependencyInstaller, InstallRequest};
use gridline_core::{Error, Result};
use std::time::Duration;
use tracing::info;

const STEP: &str = "install";

/// Runs the configured install command, e.g.
/// `python -m pip install ${{ requirements }}`.
pub struct CommandInstaller {
    template: String,
    timeout: Option<Duration>,
}

impl CommandInstaller {
    pub fn new(template: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            template: template.into(),
            timeout,
        }
    }

    fn render(&self, request: &InstallRequest) -> String {
        let requirements = request
            .requirements
            .iter()
            .map(|r| shell_quote(r))
            .collect::<Vec<_>>()
            .join(" ");
        let system_packages = request
            .system_packages
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ");

        TemplateContext {
            variables: [
                ("requirements".to_string(), requirements),
                ("system_packages".to_string(), system_packages),
                ("runtime".to_string(), request.runtime.clone()),
            ]
            .into_iter()
            .collect(),
            matrix: request.matrix.clone(),
            env: request.env.clone(),
        }
        .interpolate(&self.template)
    }
}

#[async_trait]
impl DependencyInstaller for CommandInstaller {
    async fn install(&self, request: &InstallRequest) -> Result<()> {
        if request.requirements.is_empty() && request.system_packages.is_empty() {
            info!(tag = %request.tag, "Nothing to install");
            return Ok(());
        }

        let command = self.render(request);
        info!(
            tag = %request.tag,
            packages = request.requirements.len(),
            system_packages = request.system_packages.len(),
            "Installing dependencies"
        );

        let spec = CommandSpec::new(command, &request.workdir)
            .env(&request.env)
            .timeout(self.timeout);
        let output = run_command(&spec)
            .await
            .map_err(|e| Error::infrastructure(STEP, e.to_string()))?;

        if !output.success() {
            return Err(Error::infrastructure(
                STEP,
                format!(
                    "install command exited with code {}: {}",
                    output.exit_code,
                    output.summary()
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridline_core::ErrorKind;
    use gridline_core::axis::ArtifactTag;
    use std::collections::{BTreeMap, BTreeSet};

    fn request(workdir: &std::path::Path) -> InstallRequest {
        InstallRequest {
            tag: ArtifactTag {
                backend: "duckdb".into(),
                platform: "ubuntu-latest".into(),
                runtime: "3.10".into(),
            },
            runtime: "3.10".into(),
            requirements: vec!["duckdb==0.3.2".into(), "pandas==1.4.1".into()],
            system_packages: BTreeSet::new(),
            workdir: workdir.to_path_buf(),
            env: BTreeMap::new(),
            matrix: BTreeMap::from([("os".to_string(), "ubuntu-latest".to_string())]),
        }
    }

    #[tokio::test]
    async fn test_install_renders_requirements() {
        let dir = tempfile::tempdir().unwrap();
        let installer = CommandInstaller::new(
            "echo ${{ requirements }} ${{ matrix.os }} > installed.txt",
            None,
        );
        installer.install(&request(dir.path())).await.unwrap();
        let installed = std::fs::read_to_string(dir.path().join("installed.txt")).unwrap();
        assert_eq!(installed.trim(), "duckdb==0.3.2 pandas==1.4.1 ubuntu-latest");
    }

    #[tokio::test]
    async fn test_system_packages_alone_still_install() {
        let dir = tempfile::tempdir().unwrap();
        let installer = CommandInstaller::new(
            "echo ${{ system_packages }} > system.txt",
            None,
        );
        let mut request = request(dir.path());
        request.requirements.clear();
        request.system_packages = BTreeSet::from(["libgeos-dev".to_string()]);

        installer.install(&request).await.unwrap();
        let installed = std::fs::read_to_string(dir.path().join("system.txt")).unwrap();
        assert_eq!(installed.trim(), "libgeos-dev");
    }

    #[tokio::test]
    async fn test_empty_request_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let installer = CommandInstaller::new("touch ran.txt", None);
        let mut request = request(dir.path());
        request.requirements.clear();

        installer.install(&request).await.unwrap();
        assert!(!dir.path().join("ran.txt").exists());
    }

    #[tokio::test]
    async fn test_install_failure_is_infrastructure() {
        let dir = tempfile::tempdir().unwrap();
        let installer = CommandInstaller::new("echo 'no matching distribution' >&2; exit 1", None);
        let err = installer.install(&request(dir.path())).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.to_string().contains("no matching distribution"));
    }
}
