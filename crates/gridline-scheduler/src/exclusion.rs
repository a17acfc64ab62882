//! Exclusion rules with partial-field wildcard matching.

use gridline_core::Result;
use gridline_core::axis::{AxisSet, ExclusionRule};
use gridline_core::config::RawExclusion;

/// A compiled list of exclusion rules for one axis set.
#[derive(Debug, Clone, Default)]
pub struct ExclusionEngine {
    rules: Vec<ExclusionRule>,
}

impl ExclusionEngine {
    /// Compile raw rules against `axes`. Any invalid rule (empty, unknown axis,
    /// undeclared value) rejects the whole list.
    pub fn compile(axes: &AxisSet, raw: &[RawExclusion]) -> Result<Self> {
        let rules = raw
            .iter()
            .map(|r| ExclusionRule::compile(axes, r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// An engine that excludes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Index of the first rule matching `candidate`, if any.
    pub fn matching_rule(&self, candidate: &[usize]) -> Option<usize> {
        self.rules.iter().position(|r| r.matches(candidate))
    }

    /// A candidate is dropped iff at least one rule matches it.
    pub fn excludes(&self, candidate: &[usize]) -> bool {
        self.matching_rule(candidate).is_some()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
