//! `${{ ... }}` interpolation for command templates.

use crate::{Error, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("valid expression regex"));

/// Values available to a command template.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// Plain variables: `markers`, `workers`, `report`, `coverage`, ...
    pub variables: BTreeMap<String, String>,
    /// Axis values of the current combination.
    pub matrix: BTreeMap<String, String>,
    /// Environment handed to the command (service discovery, overrides).
    pub env: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_matrix(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.matrix.insert(key.into(), value.into());
        self
    }

    /// Interpolate `input`, replacing unknown expressions with an empty string.
    ///
    /// Supports:
    /// - `${{ name }}` - variable lookup
    /// - `${{ matrix.axis }}` - axis value
    /// - `${{ env.VAR }}` - context env, then process env
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr).unwrap_or_default()
            })
            .to_string()
    }

    /// Interpolate `input`, failing on any expression that does not resolve.
    pub fn interpolate_strict(&self, input: &str) -> Result<String> {
        let unresolved = self.unresolved(input);
        if !unresolved.is_empty() {
            return Err(Error::Configuration(format!(
                "Template '{}' references unknown values: {}",
                input,
                unresolved.join(", ")
            )));
        }
        Ok(self.interpolate(input))
    }

    /// Expressions in `input` with no value in this context.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        EXPRESSION
            .captures_iter(input)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|expr| self.resolve_expression(expr).is_none())
            .collect()
    }

    fn resolve_expression(&self, expr: &str) -> Option<String> {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self
                .env
                .get(var_name)
                .cloned()
                .or_else(|| std::env::var(var_name).ok());
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned();
        }

        self.variables.get(expr).cloned()
    }
}
