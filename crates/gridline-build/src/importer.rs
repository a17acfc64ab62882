//! Post-build import checks.

use async_trait::async_trait;
use gridline_core::interpolation::TemplateContext;
use gridline_core::ports::ModuleImporter;
use gridline_core::{Error, Result};
use gridline_runner::{CommandSpec, run_command};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Runs the configured import command, e.g. `python -c 'import ${{ module }}'`.
pub struct CommandImporter {
    template: String,
    workdir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandImporter {
    pub fn new(template: impl Into<String>, workdir: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            template: template.into(),
            workdir: workdir.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ModuleImporter for CommandImporter {
    async fn verify(&self, module: &str, env: &BTreeMap<String, String>) -> Result<()> {
        let command = TemplateContext::new()
            .with_variable("module", module)
            .interpolate(&self.template);
        let spec = CommandSpec::new(command, &self.workdir)
            .env(env)
            .timeout(self.timeout);
        let output = run_command(&spec).await?;
        debug!(module, exit_code = output.exit_code, "Import check finished");

        if output.success() {
            Ok(())
        } else {
            Err(Error::ImportVerification {
                modules: vec![module.to_string()],
            })
        }
    }
}
