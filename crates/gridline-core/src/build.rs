//! Build specifications and artifacts.

use crate::axis::BackendDescriptor;
use crate::ids::BuildId;
use crate::resolution::{Requirement, Resolution};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// What to build: a backend subset and whether to run the acceptance check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    backends: BTreeSet<String>,
    run_check: bool,
}

impl BuildSpec {
    pub fn new<I, S>(backends: I, run_check: bool) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backends: BTreeSet<String> = backends.into_iter().map(Into::into).collect();
        if backends.is_empty() {
            return Err(Error::Configuration(
                "A build needs at least one backend".to_string(),
            ));
        }
        if let Some(blank) = backends.iter().find(|b| b.trim().is_empty()) {
            return Err(Error::UnknownBackend(blank.clone()));
        }
        Ok(Self {
            backends,
            run_check,
        })
    }

    pub fn backends(&self) -> &BTreeSet<String> {
        &self.backends
    }

    pub fn run_check(&self) -> bool {
        self.run_check
    }
}

/// A dependency substitution applied while deriving a build closure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOverride {
    pub backend: String,
    pub replaced: String,
    pub replacement: Requirement,
}

/// Requirements for a backend set: base dependencies, each backend's extras,
/// then each backend's substitutions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyClosure {
    pub requirements: Vec<Requirement>,
    pub overrides: Vec<AppliedOverride>,
}

impl DependencyClosure {
    /// Extras are merged for every backend before any substitution is
    /// applied, so a substitution also replaces another backend's extra.
    pub fn derive<'a>(
        base: &[Requirement],
        backends: impl IntoIterator<Item = &'a BackendDescriptor>,
    ) -> Self {
        let backends: Vec<&BackendDescriptor> = backends.into_iter().collect();

        let mut requirements = base.to_vec();
        for backend in &backends {
            for extra in &backend.dependencies {
                if !requirements.contains(extra) {
                    requirements.push(extra.clone());
                }
            }
        }

        let mut overrides = Vec::new();
        for backend in &backends {
            for substitution in &backend.overrides {
                requirements.retain(|r| r.name != substitution.package);
                if !requirements.contains(&substitution.replacement) {
                    requirements.push(substitution.replacement.clone());
                }
                overrides.push(AppliedOverride {
                    backend: backend.name.clone(),
                    replaced: substitution.package.clone(),
                    replacement: substitution.replacement.clone(),
                });
            }
        }

        Self {
            requirements,
            overrides,
        }
    }
}

/// Outcome of the optional acceptance check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSummary {
    pub selection: String,
    pub passed: bool,
    pub total: usize,
    pub failed: usize,
}

/// The accepted result of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    pub id: BuildId,
    /// Directory holding the artifact manifest and staged outputs.
    pub path: PathBuf,
    pub backends: BTreeSet<String>,
    pub requirements: Vec<Requirement>,
    pub resolution: Resolution,
    pub overrides: Vec<AppliedOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckSummary>,
    /// Backend modules that passed the post-build import check.
    pub verified_modules: BTreeSet<String>,
    /// SHA-256 over the resolved closure lines.
    pub closure_digest: String,
    pub created_at: DateTime<Utc>,
}

impl BuildArtifact {
    pub const MANIFEST: &'static str = "artifact.json";

    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(Self::MANIFEST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::DependencyOverride;

    fn req(spec: &str) -> Requirement {
        Requirement::parse(spec).unwrap()
    }

    #[test]
    fn test_closure_merges_extras() {
        let mut duckdb = BackendDescriptor::new("duckdb");
        duckdb.dependencies = vec![req("duckdb>=0.3"), req("pyarrow>=1.0")];
        let mut pandas = BackendDescriptor::new("pandas");
        pandas.dependencies = vec![req("pyarrow>=1.0")];

        let closure = DependencyClosure::derive(&[req("numpy>=1.15")], [&duckdb, &pandas]);
        let names: Vec<&str> = closure.requirements.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["numpy", "duckdb", "pyarrow"]);
        assert!(closure.overrides.is_empty());
    }

    #[test]
    fn test_closure_applies_substitutions() {
        let mut geo = BackendDescriptor::new("postgres");
        geo.dependencies = vec![req("shapely>=1.6")];
        geo.overrides = vec![DependencyOverride {
            package: "psycopg2".into(),
            replacement: req("psycopg2-binary>=2.8"),
        }];

        let closure = DependencyClosure::derive(&[req("psycopg2>=2.8")], [&geo]);
        let names: Vec<&str> = closure.requirements.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["shapely", "psycopg2-binary"]);
        assert_eq!(closure.overrides.len(), 1);
        assert_eq!(closure.overrides[0].replaced, "psycopg2");
    }

    #[test]
    fn test_spec_deduplicates_backends() {
        let spec = BuildSpec::new(["sqlite", "duckdb", "sqlite"], true).unwrap();
        assert_eq!(spec.backends().len(), 2);
        assert!(spec.run_check());
    }

    #[test]
    fn test_spec_rejects_blank_backend() {
        assert!(matches!(
            BuildSpec::new(["duckdb", " "], false),
            Err(Error::UnknownBackend(_))
        ));
    }

    #[test]
    fn test_spec_rejects_empty_backend_set() {
        let err = BuildSpec::new(Vec::<String>::new(), true).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
