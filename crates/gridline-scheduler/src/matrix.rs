//! Matrix resolution: Cartesian expansion, exclusion filtering and the
//! minimum-version overlay.

use crate::exclusion::ExclusionEngine;
use gridline_core::axis::{
    ArtifactTag, Assignment, AxisSet, BackendDescriptor, Combination, MatrixMode,
};
use gridline_core::config::MatrixConfig;
use gridline_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Output of one resolution pass.
#[derive(Debug, Clone)]
pub struct ResolvedMatrix {
    pub mode: MatrixMode,
    /// Size of the Cartesian product before exclusions.
    pub candidates: usize,
    /// Candidates dropped by exclusion rules (or, in min-version mode, by
    /// backends without pins).
    pub excluded: usize,
    pub combinations: Vec<Arc<Combination>>,
}

impl ResolvedMatrix {
    pub fn is_empty(&self) -> bool {
        self.combinations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.combinations.len()
    }
}

/// Expands axis sets into concrete combinations.
pub struct MatrixResolver {
    backends: BTreeMap<String, Arc<BackendDescriptor>>,
    backend_axis: String,
    platform_axis: String,
    runtime_axis: String,
}

impl MatrixResolver {
    pub fn new(config: &MatrixConfig) -> Self {
        Self {
            backends: config
                .backends
                .iter()
                .map(|b| (b.name.clone(), Arc::new(b.clone())))
                .collect(),
            backend_axis: config.backend_axis.clone(),
            platform_axis: config.platform_axis.clone(),
            runtime_axis: config.runtime_axis.clone(),
        }
    }

    /// Resolve the primary matrix.
    ///
    /// Combinations follow axis-declaration order, then value-declaration
    /// order, with the first axis most significant. An empty result is not an
    /// error here; callers decide what to do with it.
    pub fn resolve(&self, axes: &AxisSet, exclusions: &ExclusionEngine) -> Result<ResolvedMatrix> {
        self.expand(axes, exclusions, MatrixMode::Primary)
    }

    /// Resolve the minimum-version matrix over a reduced axis set.
    ///
    /// Only backends declaring minimum-version pins participate. Each
    /// combination carries its backend's pins as overrides, which the
    /// dependency resolver locks before resolving anything else.
    pub fn resolve_min_version(
        &self,
        axes: &AxisSet,
        exclusions: &ExclusionEngine,
    ) -> Result<ResolvedMatrix> {
        self.expand(axes, exclusions, MatrixMode::MinVersion)
    }

    fn expand(
        &self,
        axes: &AxisSet,
        exclusions: &ExclusionEngine,
        mode: MatrixMode,
    ) -> Result<ResolvedMatrix> {
        let position = |name: &str| {
            axes.position(name).ok_or_else(|| {
                Error::Configuration(format!("Axis '{}' is not declared", name))
            })
        };
        let backend_pos = position(&self.backend_axis)?;
        let platform_pos = position(&self.platform_axis)?;
        let runtime_pos = position(&self.runtime_axis)?;

        let mut combinations = Vec::new();
        let mut candidates = 0;
        let mut excluded = 0;

        for indices in cartesian(axes) {
            candidates += 1;

            if let Some(rule) = exclusions.matching_rule(&indices) {
                debug!(?indices, rule, "Combination excluded");
                excluded += 1;
                continue;
            }

            let value = |pos: usize| axes.axes()[pos].values[indices[pos]].clone();
            let backend_name = value(backend_pos);
            let backend = self.backends.get(&backend_name).cloned().ok_or_else(|| {
                Error::UnknownBackend(backend_name.clone())
            })?;

            let overrides = match mode {
                MatrixMode::Primary => Vec::new(),
                MatrixMode::MinVersion => {
                    if backend.min_versions.is_empty() {
                        excluded += 1;
                        continue;
                    }
                    backend.min_versions.clone()
                }
            };

            let assignments = axes
                .axes()
                .iter()
                .zip(&indices)
                .map(|(axis, &i)| Assignment {
                    axis: axis.name.clone(),
                    value: axis.values[i].clone(),
                })
                .collect();

            let tag = ArtifactTag {
                backend: backend_name,
                platform: value(platform_pos),
                runtime: value(runtime_pos),
            };

            combinations.push(Arc::new(Combination::new(
                combinations.len(),
                mode,
                assignments,
                indices,
                backend,
                tag,
                overrides,
            )));
        }

        debug!(
            ?mode,
            candidates,
            excluded,
            resolved = combinations.len(),
            "Matrix resolved"
        );

        Ok(ResolvedMatrix {
            mode,
            candidates,
            excluded,
            combinations,
        })
    }
}

/// Every value-index tuple of `axes`, first axis most significant.
fn cartesian(axes: &AxisSet) -> Vec<Vec<usize>> {
    let mut result: Vec<Vec<usize>> = vec![Vec::new()];

    for axis in axes.axes() {
        let mut next = Vec::with_capacity(result.len() * axis.values.len());
        for prefix in result {
            for i in 0..axis.values.len() {
                let mut combo = prefix.clone();
                combo.push(i);
                next.push(combo);
            }
        }
        result = next;
    }

    result
}

/// Both resolution passes for one configuration.
#[derive(Debug, Clone)]
pub struct MatrixPlan {
    pub primary: ResolvedMatrix,
    pub min_version: Option<ResolvedMatrix>,
}

impl MatrixPlan {
    /// Resolve the primary and (if configured) min-version matrices.
    ///
    /// Fails with [`Error::EmptyMatrix`] when no primary combination
    /// survives, whatever the min-version pass would add.
    pub fn from_config(config: &MatrixConfig) -> Result<Self> {
        let resolver = MatrixResolver::new(config);
        let axes = config.axis_set()?;
        let exclusions = ExclusionEngine::compile(&axes, &config.exclude)?;
        let primary = resolver.resolve(&axes, &exclusions)?;
        if primary.is_empty() {
            return Err(Error::EmptyMatrix);
        }

        let min_version = match &config.min_version {
            Some(min) => {
                let reduced = axes.restrict(&min.axes)?;
                let exclusions = ExclusionEngine::compile(&reduced, &min.exclude)?;
                Some(resolver.resolve_min_version(&reduced, &exclusions)?)
            }
            None => None,
        };

        Ok(Self {
            primary,
            min_version,
        })
    }

    /// Primary combinations, then min-version combinations.
    pub fn combinations(&self) -> impl Iterator<Item = &Arc<Combination>> {
        self.primary
            .combinations
            .iter()
            .chain(self.min_version.iter().flat_map(|m| m.combinations.iter()))
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.min_version.as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn candidates(&self) -> usize {
        self.primary.candidates + self.min_version.as_ref().map_or(0, |m| m.candidates)
    }
}
