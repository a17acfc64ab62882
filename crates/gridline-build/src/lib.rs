//! Gridline package builds.
//!
//! A build merges the dependency closure of a backend subset, optionally
//! runs the acceptance check scoped to those backends and core, then checks
//! that every backend module imports.

pub mod builder;
pub mod importer;

pub use builder::{BuildSettings, PackageBuilder};
pub use importer::CommandImporter;
