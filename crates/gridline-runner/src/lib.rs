//! Gridline job runner.
//!
//! Drives a single job through provisioning, dependency installation, asset
//! staging and the test run, and emits its reports.

pub mod artifacts;
pub mod command;
pub mod executor;
pub mod install;
pub mod lanes;
pub mod runner;
pub mod services;
pub mod staging;

pub use artifacts::FsArtifactSink;
pub use command::{CommandOutput, CommandSpec, run_command, shell_quote};
pub use executor::{CommandTestExecutor, SuiteTestExecutor};
pub use install::CommandInstaller;
pub use runner::{INSTALL_DIR_ENV, JobRunner, RunnerSettings};
pub use services::{DockerProvisioner, EnvProvisioner, ServiceLease};
pub use staging::StagedAssets;
