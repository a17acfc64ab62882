//! Matrix configuration: the declarative document describing axes, backends,
//! exclusions, services and commands.

use crate::axis::{AxisSet, BackendDescriptor, ExclusionRule, Axis};
use crate::interpolation::TemplateContext;
use crate::resolution::{PackageIndex, Requirement};
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A partial record over axis names. Absent axes are wildcards.
pub type RawExclusion = BTreeMap<String, String>;

/// Top-level matrix configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MatrixConfig {
    /// Name of the library under test; used to derive backend module paths.
    pub package: String,
    /// Axes in declaration order.
    pub axes: Vec<Axis>,
    #[serde(default = "default_backend_axis")]
    pub backend_axis: String,
    #[serde(default = "default_platform_axis")]
    pub platform_axis: String,
    #[serde(default = "default_runtime_axis")]
    pub runtime_axis: String,
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,
    #[serde(default)]
    pub exclude: Vec<RawExclusion>,
    #[serde(default)]
    pub min_version: Option<MinVersionConfig>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDefinition>,
    #[serde(default)]
    #[schemars(with = "Vec<String>")]
    pub base_dependencies: Vec<Requirement>,
    #[serde(default)]
    #[schemars(with = "BTreeMap<String, Vec<String>>")]
    pub package_index: PackageIndex,
    #[serde(default)]
    pub triggers: TriggerConfig,
    #[serde(default)]
    pub commands: CommandConfig,
    /// Shared read-only test-data directory, relative to the config file.
    #[serde(default)]
    pub assets: Option<PathBuf>,
    #[serde(default)]
    #[schemars(with = "String")]
    pub workers: Workers,
    /// Built-in test cases, used instead of the `test` command when present.
    #[serde(default)]
    pub suite: Vec<SuiteCase>,
}

fn default_backend_axis() -> String {
    "backend".to_string()
}

fn default_platform_axis() -> String {
    "os".to_string()
}

fn default_runtime_axis() -> String {
    "runtime".to_string()
}

/// The secondary, minimum-version matrix.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MinVersionConfig {
    /// Axes participating in min-version testing, restricted to these values.
    /// Axes not listed keep all their values.
    #[serde(default)]
    pub axes: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<RawExclusion>,
}

/// An externally provisioned network service.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServiceDefinition {
    /// Container image; required for Docker provisioning.
    #[serde(default)]
    pub image: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    /// Environment passed to the service container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,
}

fn default_readiness_timeout() -> u64 {
    120
}

/// When a code-change event starts a matrix run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    /// Branch patterns; empty matches every branch.
    #[serde(default)]
    pub branches: Vec<String>,
    /// Documentation-class paths that never trigger a run on their own.
    #[serde(default)]
    pub paths_ignore: Vec<String>,
    /// Whether pull-request events trigger runs.
    #[serde(default = "default_true")]
    pub pull_requests: bool,
}

fn default_true() -> bool {
    true
}

/// Command templates for the external collaborators.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    #[serde(default = "default_install_command")]
    pub install: String,
    #[serde(default = "default_test_command")]
    pub test: String,
    #[serde(default = "default_import_command")]
    pub import: String,
    /// Per-command timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            install: default_install_command(),
            test: default_test_command(),
            import: default_import_command(),
            timeout_secs: None,
        }
    }
}

fn default_install_command() -> String {
    "python -m pip install ${{ requirements }}".to_string()
}

fn default_test_command() -> String {
    "python -m pytest -m '${{ markers }}' -n ${{ workers }} --dist loadgroup \
     --junitxml=${{ report }} --cov --cov-report=json:${{ coverage }}"
        .to_string()
}

fn default_import_command() -> String {
    "python -c 'import ${{ module }}'".to_string()
}

/// One declared test case for the built-in suite executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SuiteCase {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub markers: Vec<String>,
    /// Cases sharing a group always run in the same lane.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Test parallelism within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Workers {
    #[default]
    Auto,
    Fixed(usize),
}

impl Workers {
    pub fn resolve(&self) -> usize {
        match self {
            Workers::Auto => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            Workers::Fixed(n) => (*n).max(1),
        }
    }
}

impl FromStr for Workers {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "auto" => Ok(Workers::Auto),
            other => match other.parse::<usize>() {
                Ok(n) if n > 0 => Ok(Workers::Fixed(n)),
                _ => Err(Error::Configuration(format!(
                    "Invalid worker count '{}': expected 'auto' or a positive integer",
                    s
                ))),
            },
        }
    }
}

impl fmt::Display for Workers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Workers::Auto => write!(f, "auto"),
            Workers::Fixed(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for Workers {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Workers::Auto => serializer.serialize_str("auto"),
            Workers::Fixed(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for Workers {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(u64),
            Keyword(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Workers::from_str(&n.to_string()),
            Repr::Keyword(s) => Workers::from_str(&s),
        }
        .map_err(serde::de::Error::custom)
    }
}

impl MatrixConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&content)?;
        if let (Some(assets), Some(base)) = (&config.assets, path.parent())
            && assets.is_relative()
        {
            config.assets = Some(base.join(assets));
        }
        Ok(config)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: MatrixConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every cross-reference in the document. Nothing here touches the
    /// outside world; all failures are configuration errors.
    pub fn validate(&self) -> Result<()> {
        if self.package.trim().is_empty() {
            return Err(Error::Configuration("'package' must not be empty".to_string()));
        }

        let axes = self.axis_set()?;
        for name in [&self.backend_axis, &self.platform_axis, &self.runtime_axis] {
            if axes.position(name).is_none() {
                return Err(Error::Configuration(format!(
                    "Axis '{}' is referenced but not declared",
                    name
                )));
            }
        }

        let mut names = BTreeSet::new();
        for backend in &self.backends {
            if !names.insert(backend.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "Backend '{}' is described more than once",
                    backend.name
                )));
            }
            for service in &backend.required_services {
                if !self.services.contains_key(service) {
                    return Err(Error::Configuration(format!(
                        "Backend '{}' requires undefined service '{}'",
                        backend.name, service
                    )));
                }
            }
        }

        if let Some(axis) = axes.get(&self.backend_axis) {
            for value in &axis.values {
                if !names.contains(value.as_str()) {
                    return Err(Error::Configuration(format!(
                        "Backend '{}' has no descriptor",
                        value
                    )));
                }
            }
        }

        for raw in &self.exclude {
            ExclusionRule::compile(&axes, raw)?;
        }

        if let Some(min_version) = &self.min_version {
            let reduced = axes.restrict(&min_version.axes)?;
            for raw in &min_version.exclude {
                ExclusionRule::compile(&reduced, raw)?;
            }
        }

        for service in self.services.keys() {
            if service.is_empty() || !service.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(Error::Configuration(format!(
                    "Service name '{}' must be alphanumeric",
                    service
                )));
            }
        }

        self.validate_templates(&axes)?;

        let mut case_ids = BTreeSet::new();
        for case in &self.suite {
            if !case_ids.insert(case.id.as_str()) {
                return Err(Error::Configuration(format!(
                    "Suite case '{}' declared more than once",
                    case.id
                )));
            }
        }

        Ok(())
    }

    fn validate_templates(&self, axes: &AxisSet) -> Result<()> {
        let ctx = TemplateContext::new();
        let templates = [
            ("install", &self.commands.install),
            ("test", &self.commands.test),
            ("import", &self.commands.import),
        ];
        for (name, template) in templates {
            for expr in ctx.unresolved(template) {
                if let Some(axis) = expr.strip_prefix("matrix.")
                    && axes.position(axis).is_none()
                {
                    return Err(Error::Configuration(format!(
                        "Command '{}' references undeclared axis '{}'",
                        name, axis
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn axis_set(&self) -> Result<AxisSet> {
        AxisSet::new(self.axes.clone())
    }

    pub fn backend(&self, name: &str) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|b| b.name == name)
    }

    /// Map backend names to descriptors, failing fast on the first unknown name.
    pub fn select_backends<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<&BackendDescriptor>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.backend(name)
                    .ok_or_else(|| Error::UnknownBackend(name.to_string()))
            })
            .collect()
    }

    /// Narrow the backend axis to `names`. Exclusion rules that can only match
    /// dropped backends are removed with them.
    pub fn restrict_backends<S: AsRef<str>>(&self, names: &[S]) -> Result<MatrixConfig> {
        self.select_backends(names)?;
        let keep: BTreeSet<&str> = names.iter().map(|n| n.as_ref()).collect();

        let mut restricted = self.clone();
        for axis in restricted.axes.iter_mut().filter(|a| a.name == self.backend_axis) {
            axis.values.retain(|v| keep.contains(v.as_str()));
        }
        if restricted
            .axes
            .iter()
            .any(|a| a.name == self.backend_axis && a.values.is_empty())
        {
            return Err(Error::Configuration(
                "None of the selected backends appear on the backend axis".to_string(),
            ));
        }

        let survives = |rule: &RawExclusion| {
            rule.get(&self.backend_axis)
                .is_none_or(|value| keep.contains(value.as_str()))
        };
        restricted.exclude.retain(survives);

        let mut drop_min_version = false;
        if let Some(min_version) = &mut restricted.min_version {
            min_version.exclude.retain(survives);
            if let Some(values) = min_version.axes.get_mut(&self.backend_axis) {
                values.retain(|v| keep.contains(v.as_str()));
                drop_min_version = values.is_empty();
            }
        }
        if drop_min_version {
            restricted.min_version = None;
        }

        restricted.validate()?;
        Ok(restricted)
    }

    /// JSON schema of the configuration document.
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(MatrixConfig)
    }
}
