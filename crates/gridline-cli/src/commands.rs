//! CLI command definitions.

use clap::{Subcommand, ValueEnum};
use gridline_core::config::Workers;
use gridline_scheduler::GitRef;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the matrix configuration
    Validate,

    /// Print the resolved job matrix
    Resolve {
        /// Restrict the backend axis to these backends
        #[arg(short, long = "backend", value_delimiter = ',')]
        backends: Vec<String>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run the matrix for a trigger and report the gate
    Run {
        /// Branch name or pull request reference (`refs/pull/42`, `#42`)
        #[arg(short = 'r', long = "ref", default_value = "main")]
        reference: GitRef,

        /// Commit being tested
        #[arg(long, default_value = "HEAD")]
        commit: String,

        /// Target branch of a pull request
        #[arg(long, default_value = "main")]
        target: String,

        /// Paths changed by the trigger; used by path filters
        #[arg(long = "changed", value_delimiter = ',')]
        changed_paths: Vec<String>,

        /// Restrict the backend axis to these backends
        #[arg(short, long = "backend", value_delimiter = ',')]
        backends: Vec<String>,

        /// How services are provided to jobs
        #[arg(long, value_enum, env = "GRIDLINE_PROVISIONER", default_value_t = Provisioner::Env)]
        provisioner: Provisioner,

        /// Test workers per job (`auto` or a count)
        #[arg(short, long, env = "GRIDLINE_WORKERS")]
        workers: Option<Workers>,
    },

    /// Build the package for a backend subset
    Build {
        /// Backends to build for
        #[arg(short, long = "backend", value_delimiter = ',', required = true)]
        backends: Vec<String>,

        /// Run the backend-and-core acceptance check before accepting the build
        #[arg(long)]
        check: bool,

        /// Output directory for build artifacts
        #[arg(short, long, env = "GRIDLINE_BUILD_DIR", default_value = "dist")]
        out: PathBuf,

        /// Test workers for the acceptance check
        #[arg(short, long, env = "GRIDLINE_WORKERS")]
        workers: Option<Workers>,
    },

    /// Print the JSON schema of the configuration file
    Schema,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Provisioner {
    /// Services are already running; discover them from the environment
    Env,
    /// Start one container per job and service
    Docker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}
