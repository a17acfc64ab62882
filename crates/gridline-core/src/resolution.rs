//! Dependency requirements and two-phase (pin-then-resolve) resolution.
//!
//! Requirements are written in the library's packaging syntax
//! (`pyarrow>=1.0,<1.1`, `duckdb==0.6.0`, `sqlalchemy~=1.4`) and normalized
//! onto `semver` requirements. Resolution always locks pinned packages first;
//! the free pass that follows never revisits a locked package, so a pin can
//! never be widened by a later upgrade.

use crate::{Error, Result};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// A parsed version constraint, keeping the text it was written as.
#[derive(Debug, Clone)]
pub struct VersionConstraint {
    raw: String,
    req: VersionReq,
}

impl VersionConstraint {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let normalized = normalize_constraint(raw)?;
        let req = VersionReq::parse(&normalized).map_err(|e| {
            Error::Configuration(format!("Invalid version constraint '{}': {}", raw, e))
        })?;
        Ok(Self {
            raw: raw.to_string(),
            req,
        })
    }

    /// A constraint accepting any version.
    pub fn any() -> Self {
        Self {
            raw: String::new(),
            req: VersionReq::STAR,
        }
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.req.matches(version)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for VersionConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.req == other.req
    }
}

impl Eq for VersionConstraint {}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parse a version, padding partial versions (`1.5` becomes `1.5.0`).
pub fn parse_version(raw: &str) -> Result<Version> {
    let raw = raw.trim();
    let padded = pad_version(raw);
    Version::parse(&padded)
        .map_err(|e| Error::Configuration(format!("Invalid version '{}': {}", raw, e)))
}

fn pad_version(raw: &str) -> String {
    match raw.split('.').count() {
        1 => format!("{}.0.0", raw),
        2 => format!("{}.0", raw),
        _ => raw.to_string(),
    }
}

fn normalize_constraint(raw: &str) -> Result<String> {
    if raw.is_empty() || raw == "*" {
        return Ok("*".to_string());
    }

    let mut parts = Vec::new();
    for clause in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        if clause.starts_with("!=") {
            return Err(Error::Configuration(format!(
                "Exclusion constraints are not supported: '{}'",
                clause
            )));
        }
        if let Some(version) = clause.strip_prefix("~=") {
            // Compatible release: drop the last component for the upper bound.
            let version = version.trim();
            let components: Vec<&str> = version.split('.').collect();
            if components.len() < 2 {
                return Err(Error::Configuration(format!(
                    "Compatible release needs at least two components: '{}'",
                    clause
                )));
            }
            let prefix = &components[..components.len() - 1];
            let mut upper: Vec<u64> = prefix
                .iter()
                .map(|c| c.parse::<u64>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| {
                    Error::Configuration(format!("Invalid compatible release: '{}'", clause))
                })?;
            if let Some(last) = upper.last_mut() {
                *last += 1;
            }
            let upper = upper
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(".");
            parts.push(format!(">={}", pad_version(version)));
            parts.push(format!("<{}", pad_version(&upper)));
        } else if let Some(version) = clause.strip_prefix("==") {
            parts.push(format!("={}", pad_version(version.trim())));
        } else if clause.starts_with(['<', '>', '=', '^', '~']) {
            // Partial versions mean the padded release, not a semver range.
            let split = clause
                .find(|c: char| !matches!(c, '<' | '>' | '=' | '^' | '~'))
                .unwrap_or(clause.len());
            let (op, version) = clause.split_at(split);
            let version = version.trim();
            if version.is_empty() {
                return Err(Error::Configuration(format!(
                    "Constraint has no version: '{}'",
                    clause
                )));
            }
            parts.push(format!("{}{}", op, pad_version(version)));
        } else {
            parts.push(format!("={}", pad_version(clause)));
        }
    }

    Ok(parts.join(", "))
}

/// A named dependency with a version constraint: `name<constraint>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Requirement {
    pub name: String,
    pub constraint: VersionConstraint,
}

impl Requirement {
    pub fn new(name: impl Into<String>, constraint: VersionConstraint) -> Self {
        Self {
            name: name.into(),
            constraint,
        }
    }

    pub fn parse(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        let split = spec
            .find(|c: char| matches!(c, '<' | '>' | '=' | '!' | '~' | '^' | ' '))
            .unwrap_or(spec.len());
        let name = spec[..split].trim();
        if name.is_empty() {
            return Err(Error::Configuration(format!(
                "Requirement has no package name: '{}'",
                spec
            )));
        }
        Ok(Self {
            name: name.to_string(),
            constraint: VersionConstraint::parse(&spec[split..])?,
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.constraint)
    }
}

impl TryFrom<String> for Requirement {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Requirement> for String {
    fn from(req: Requirement) -> Self {
        req.to_string()
    }
}

/// Versions available for each package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct PackageIndex {
    packages: BTreeMap<String, Vec<Version>>,
}

impl PackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a version of a package.
    pub fn insert(&mut self, name: impl Into<String>, version: Version) {
        let versions = self.packages.entry(name.into()).or_default();
        if let Err(pos) = versions.binary_search(&version) {
            versions.insert(pos, version);
        }
    }

    pub fn with_versions(mut self, name: &str, versions: &[&str]) -> Result<Self> {
        for v in versions {
            self.insert(name, parse_version(v)?);
        }
        Ok(self)
    }

    /// Versions of a package, ascending.
    pub fn versions(&self, name: &str) -> Option<&[Version]> {
        self.packages.get(name).map(Vec::as_slice)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

impl TryFrom<BTreeMap<String, Vec<String>>> for PackageIndex {
    type Error = Error;

    fn try_from(raw: BTreeMap<String, Vec<String>>) -> Result<Self> {
        let mut index = PackageIndex::new();
        for (name, versions) in raw {
            for v in versions {
                index.insert(name.clone(), parse_version(&v)?);
            }
        }
        Ok(index)
    }
}

impl From<PackageIndex> for BTreeMap<String, Vec<String>> {
    fn from(index: PackageIndex) -> Self {
        index
            .packages
            .into_iter()
            .map(|(k, v)| (k, v.iter().map(Version::to_string).collect()))
            .collect()
    }
}

/// A package locked to a single version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedPackage {
    pub name: String,
    pub version: Version,
    /// Locked during the pin phase.
    pub pinned: bool,
}

/// The outcome of resolution: one version per package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub packages: BTreeMap<String, ResolvedPackage>,
}

impl Resolution {
    pub fn version(&self, name: &str) -> Option<&Version> {
        self.packages.get(name).map(|p| &p.version)
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Exact requirement lines (`name==version`), sorted by name.
    pub fn to_lines(&self) -> Vec<String> {
        self.packages
            .values()
            .map(|p| format!("{}=={}", p.name, p.version))
            .collect()
    }
}

/// Resolver over a [`PackageIndex`].
pub struct Resolver<'a> {
    index: &'a PackageIndex,
}

impl<'a> Resolver<'a> {
    pub fn new(index: &'a PackageIndex) -> Self {
        Self { index }
    }

    /// Resolve `requirements`, locking every package named in `pins` first.
    ///
    /// A pinned package takes the highest version satisfying its pins and
    /// every base requirement on it. The remaining packages are then resolved
    /// freely to their highest satisfying version; locked packages are never
    /// re-resolved.
    pub fn resolve(&self, requirements: &[Requirement], pins: &[Requirement]) -> Result<Resolution> {
        let mut resolution = Resolution::default();

        // Phase 1: lock pins.
        for name in ordered_names(pins) {
            let constraints: Vec<&VersionConstraint> = pins
                .iter()
                .chain(requirements.iter())
                .filter(|r| r.name == name)
                .map(|r| &r.constraint)
                .collect();
            let version = self.select(&name, &constraints)?;
            debug!(package = %name, version = %version, "Pinned dependency locked");
            resolution.packages.insert(
                name.clone(),
                ResolvedPackage {
                    name,
                    version,
                    pinned: true,
                },
            );
        }

        // Phase 2: resolve everything else around the locked set.
        for name in ordered_names(requirements) {
            if resolution.packages.contains_key(&name) {
                continue;
            }
            let constraints: Vec<&VersionConstraint> = requirements
                .iter()
                .filter(|r| r.name == name)
                .map(|r| &r.constraint)
                .collect();
            let version = self.select(&name, &constraints)?;
            debug!(package = %name, version = %version, "Dependency resolved");
            resolution.packages.insert(
                name.clone(),
                ResolvedPackage {
                    name,
                    version,
                    pinned: false,
                },
            );
        }

        Ok(resolution)
    }

    /// Requirement lines to hand to an installer.
    ///
    /// With an empty index nothing can be resolved locally: pins replace the
    /// requirements on the same package and the installer resolves the rest.
    pub fn requirement_lines(
        &self,
        requirements: &[Requirement],
        pins: &[Requirement],
    ) -> Result<Vec<String>> {
        if !self.index.is_empty() {
            return Ok(self.resolve(requirements, pins)?.to_lines());
        }
        let mut lines: Vec<String> = requirements
            .iter()
            .filter(|r| !pins.iter().any(|p| p.name == r.name))
            .map(Requirement::to_string)
            .collect();
        lines.extend(pins.iter().map(Requirement::to_string));
        lines.dedup();
        Ok(lines)
    }

    fn select(&self, name: &str, constraints: &[&VersionConstraint]) -> Result<Version> {
        let versions = self.index.versions(name).ok_or_else(|| Error::Unsatisfiable {
            package: name.to_string(),
            reason: "not present in package index".to_string(),
        })?;

        versions
            .iter()
            .rev()
            .find(|v| constraints.iter().all(|c| c.matches(v)))
            .cloned()
            .ok_or_else(|| Error::Unsatisfiable {
                package: name.to_string(),
                reason: format!(
                    "no version satisfies [{}]",
                    constraints
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>()
                        .join("; ")
                ),
            })
    }
}

fn ordered_names(requirements: &[Requirement]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for r in requirements {
        if !names.contains(&r.name) {
            names.push(r.name.clone());
        }
    }
    names
}
