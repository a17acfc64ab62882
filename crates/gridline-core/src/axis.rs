//! Matrix axes, backend descriptors, exclusion records and combinations.

use crate::resolution::Requirement;
use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// One independent configuration dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Axis {
    pub name: String,
    pub values: Vec<String>,
}

impl Axis {
    pub fn new(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn position(&self, value: &str) -> Option<usize> {
        self.values.iter().position(|v| v == value)
    }
}

/// The declared axes, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisSet {
    axes: Vec<Axis>,
}

impl AxisSet {
    /// Build an axis set, rejecting duplicate or empty axes and values.
    pub fn new(axes: Vec<Axis>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for axis in &axes {
            if axis.name.trim().is_empty() {
                return Err(Error::Configuration("Axis with empty name".to_string()));
            }
            if !seen.insert(axis.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "Axis '{}' declared more than once",
                    axis.name
                )));
            }
            if axis.values.is_empty() {
                return Err(Error::Configuration(format!(
                    "Axis '{}' has no values",
                    axis.name
                )));
            }
            let mut values = BTreeSet::new();
            for value in &axis.values {
                if !values.insert(value.as_str()) {
                    return Err(Error::Configuration(format!(
                        "Axis '{}' lists value '{}' more than once",
                        axis.name, value
                    )));
                }
            }
        }
        Ok(Self { axes })
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn len(&self) -> usize {
        self.axes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.axes.iter().position(|a| a.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Axis> {
        self.axes.iter().find(|a| a.name == name)
    }

    /// Restrict some axes to a subset of their values, keeping declaration
    /// order of both axes and values.
    pub fn restrict(&self, reduced: &BTreeMap<String, Vec<String>>) -> Result<AxisSet> {
        for (name, values) in reduced {
            let axis = self.get(name).ok_or_else(|| {
                Error::Configuration(format!("Reduced axis '{}' is not a declared axis", name))
            })?;
            if let Some(unknown) = values.iter().find(|v| axis.position(v).is_none()) {
                return Err(Error::Configuration(format!(
                    "Reduced axis '{}' lists undeclared value '{}'",
                    name, unknown
                )));
            }
        }

        let axes = self
            .axes
            .iter()
            .map(|axis| match reduced.get(&axis.name) {
                Some(keep) => Axis {
                    name: axis.name.clone(),
                    values: axis
                        .values
                        .iter()
                        .filter(|v| keep.contains(v))
                        .cloned()
                        .collect(),
                },
                None => axis.clone(),
            })
            .collect();

        AxisSet::new(axes)
    }
}

/// Substitutes one dependency with an alternate implementation when a
/// backend is selected (e.g. a compiled-extension variant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DependencyOverride {
    /// Package being replaced.
    pub package: String,
    /// Replacement requirement.
    #[schemars(with = "String")]
    pub replacement: Requirement,
}

/// Per-backend requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BackendDescriptor {
    pub name: String,
    /// Top-level module checked for importability after a build.
    #[serde(default)]
    pub module: Option<String>,
    /// Test tag selecting this backend's tests; defaults to the backend name.
    #[serde(default)]
    pub marker: Option<String>,
    #[serde(default)]
    pub required_services: BTreeSet<String>,
    #[serde(default)]
    pub system_packages: BTreeSet<String>,
    /// Extra dependencies merged into the closure ("extras").
    #[serde(default)]
    #[schemars(with = "Vec<String>")]
    pub dependencies: Vec<Requirement>,
    #[serde(default)]
    pub overrides: Vec<DependencyOverride>,
    /// Oldest supported versions, applied by the min-version matrix.
    #[serde(default)]
    #[schemars(with = "Vec<String>")]
    pub min_versions: Vec<Requirement>,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            module: None,
            marker: None,
            required_services: BTreeSet::new(),
            system_packages: BTreeSet::new(),
            dependencies: Vec::new(),
            overrides: Vec::new(),
            min_versions: Vec::new(),
        }
    }

    pub fn marker(&self) -> &str {
        self.marker.as_deref().unwrap_or(&self.name)
    }

    /// Module to import, `<package>.backends.<name>` unless set explicitly.
    pub fn module(&self, package: &str) -> String {
        self.module
            .clone()
            .unwrap_or_else(|| format!("{}.backends.{}", package, self.name))
    }
}

/// A compiled exclusion rule: one optional value per axis, aligned with the
/// axis declaration order. `None` is a wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionRule {
    fields: Vec<Option<usize>>,
}

impl ExclusionRule {
    /// Compile a partial record (`axis -> value`) against an axis set.
    ///
    /// Rejects empty rules, unknown axes and undeclared values.
    pub fn compile(axes: &AxisSet, raw: &BTreeMap<String, String>) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Configuration(
                "Exclusion rule with no fields would exclude every combination".to_string(),
            ));
        }

        let mut fields = vec![None; axes.len()];
        for (name, value) in raw {
            let position = axes.position(name).ok_or_else(|| {
                Error::Configuration(format!("Exclusion rule names unknown axis '{}'", name))
            })?;
            let value_index = axes.axes()[position].position(value).ok_or_else(|| {
                Error::Configuration(format!(
                    "Exclusion rule value '{}' is not declared on axis '{}'",
                    value, name
                ))
            })?;
            fields[position] = Some(value_index);
        }

        Ok(Self { fields })
    }

    /// True iff every populated field equals the candidate's value.
    pub fn matches(&self, candidate: &[usize]) -> bool {
        self.fields
            .iter()
            .zip(candidate)
            .all(|(field, value)| field.is_none_or(|f| f == *value))
    }

    pub fn populated(&self) -> usize {
        self.fields.iter().filter(|f| f.is_some()).count()
    }
}

/// Which resolution pass produced a combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatrixMode {
    Primary,
    MinVersion,
}

/// One axis assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub axis: String,
    pub value: String,
}

/// `(backend, platform, runtime)` attribution used to tag artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactTag {
    pub backend: String,
    pub platform: String,
    pub runtime: String,
}

impl fmt::Display for ArtifactTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.backend, self.platform, self.runtime)
    }
}

/// One concrete assignment across all axes. Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Combination {
    index: usize,
    mode: MatrixMode,
    assignments: Vec<Assignment>,
    #[serde(skip)]
    value_indices: Vec<usize>,
    backend: Arc<BackendDescriptor>,
    tag: ArtifactTag,
    overrides: Vec<Requirement>,
}

impl Combination {
    pub fn new(
        index: usize,
        mode: MatrixMode,
        assignments: Vec<Assignment>,
        value_indices: Vec<usize>,
        backend: Arc<BackendDescriptor>,
        tag: ArtifactTag,
        overrides: Vec<Requirement>,
    ) -> Self {
        Self {
            index,
            mode,
            assignments,
            value_indices,
            backend,
            tag,
            overrides,
        }
    }

    /// Position in the resolved sequence.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn mode(&self) -> MatrixMode {
        self.mode
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn value_indices(&self) -> &[usize] {
        &self.value_indices
    }

    pub fn value(&self, axis: &str) -> Option<&str> {
        self.assignments
            .iter()
            .find(|a| a.axis == axis)
            .map(|a| a.value.as_str())
    }

    pub fn backend(&self) -> &BackendDescriptor {
        &self.backend
    }

    pub fn tag(&self) -> &ArtifactTag {
        &self.tag
    }

    /// Version pins the dependency resolver must lock before anything else.
    pub fn overrides(&self) -> &[Requirement] {
        &self.overrides
    }

    /// Values in axis order, e.g. `(ubuntu-latest, 3.10, postgres)`.
    pub fn values(&self) -> Vec<&str> {
        self.assignments.iter().map(|a| a.value.as_str()).collect()
    }

    pub fn display_name(&self) -> String {
        let values = self.values().join(", ");
        match self.mode {
            MatrixMode::Primary => format!("({})", values),
            MatrixMode::MinVersion => format!("min-version ({})", values),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axes() -> AxisSet {
        AxisSet::new(vec![
            Axis::new("os", &["linux", "windows"]),
            Axis::new("backend", &["a", "b"]),
        ])
        .unwrap()
    }

    fn rule(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_axis_set_rejects_duplicates() {
        let err = AxisSet::new(vec![Axis::new("os", &["linux"]), Axis::new("os", &["macos"])]);
        assert!(err.is_err());

        let err = AxisSet::new(vec![Axis::new("os", &["linux", "linux"])]);
        assert!(err.is_err());

        let err = AxisSet::new(vec![Axis::new("os", &[])]);
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_rule_rejected() {
        let err = ExclusionRule::compile(&axes(), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_rule_with_unknown_axis_rejected() {
        assert!(ExclusionRule::compile(&axes(), &rule(&[("arch", "arm64")])).is_err());
        assert!(ExclusionRule::compile(&axes(), &rule(&[("os", "plan9")])).is_err());
    }

    #[test]
    fn test_partial_rule_is_wildcard_on_other_fields() {
        let r = ExclusionRule::compile(&axes(), &rule(&[("backend", "b")])).unwrap();
        assert_eq!(r.populated(), 1);
        assert!(r.matches(&[0, 1]));
        assert!(r.matches(&[1, 1]));
        assert!(!r.matches(&[0, 0]));
        assert!(!r.matches(&[1, 0]));
    }

    #[test]
    fn test_full_rule_matches_exactly_one() {
        let r = ExclusionRule::compile(&axes(), &rule(&[("os", "windows"), ("backend", "a")]))
            .unwrap();
        assert!(r.matches(&[1, 0]));
        assert!(!r.matches(&[1, 1]));
        assert!(!r.matches(&[0, 0]));
    }

    #[test]
    fn test_restrict_keeps_declaration_order() {
        let mut reduced = BTreeMap::new();
        reduced.insert("backend".to_string(), vec!["b".to_string(), "a".to_string()]);
        reduced.insert("os".to_string(), vec!["windows".to_string()]);

        let restricted = axes().restrict(&reduced).unwrap();
        assert_eq!(restricted.axes()[0].values, vec!["windows"]);
        assert_eq!(restricted.axes()[1].values, vec!["a", "b"]);
    }

    #[test]
    fn test_restrict_rejects_unknown_values() {
        let mut reduced = BTreeMap::new();
        reduced.insert("os".to_string(), vec!["macos".to_string()]);
        assert!(axes().restrict(&reduced).is_err());
    }

    #[test]
    fn test_backend_defaults() {
        let backend = BackendDescriptor::new("duckdb");
        assert_eq!(backend.marker(), "duckdb");
        assert_eq!(backend.module("ibis"), "ibis.backends.duckdb");
    }
}
