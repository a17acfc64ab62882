//! Gridline CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;

mod commands;
mod config;
mod handlers;

use commands::{Commands, LogFormat};

#[derive(Parser)]
#[command(name = "gridline")]
#[command(author, version, about = "Declarative test matrices and backend-scoped builds", long_about = None)]
struct Cli {
    /// Matrix configuration file (searched for when omitted)
    #[arg(short, long, global = true, env = "GRIDLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Artifact store root
    #[arg(long, global = true, env = "GRIDLINE_ARTIFACTS", default_value = ".gridline/artifacts")]
    artifacts: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, env = "GRIDLINE_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config_path = || config::find_config_file(cli.config.as_deref());

    match cli.command {
        Commands::Validate => handlers::validate(&config_path()?)?,
        Commands::Resolve { backends, json } => {
            handlers::resolve(&config_path()?, &backends, json)?
        }
        Commands::Run {
            reference,
            commit,
            target,
            changed_paths,
            backends,
            provisioner,
            workers,
        } => {
            let passed = handlers::run(
                &config_path()?,
                &cli.artifacts,
                handlers::RunArgs {
                    reference,
                    commit,
                    target,
                    changed_paths,
                    backends,
                    provisioner,
                    workers,
                },
            )
            .await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Build {
            backends,
            check,
            out,
            workers,
        } => {
            handlers::build(&config_path()?, &cli.artifacts, &backends, check, &out, workers)
                .await?
        }
        Commands::Schema => handlers::schema()?,
    }

    Ok(())
}
