//! Command handlers.

use crate::commands::Provisioner;
use crate::config;
use anyhow::{Context, Result};
use console::style;
use futures::StreamExt;
use gridline_build::{BuildSettings, PackageBuilder};
use gridline_core::build::BuildSpec;
use gridline_core::config::{MatrixConfig, Workers};
use gridline_core::events::Event;
use gridline_core::job::{GateResult, JobOutcome};
use gridline_core::ports::{ArtifactScope, EventBus, ServiceProvisioner};
use gridline_runner::{DockerProvisioner, EnvProvisioner, FsArtifactSink, JobRunner};
use gridline_scheduler::{Dispatcher, GitRef, InMemoryEventBus, MatrixPlan, TriggerEvent};
use std::path::Path;
use std::sync::Arc;

/// Load a config, narrowed to `backends` when any are given.
fn load_scoped(path: &Path, backends: &[String]) -> Result<MatrixConfig> {
    let config = config::load(path)?;
    if backends.is_empty() {
        Ok(config)
    } else {
        Ok(config.restrict_backends(backends)?)
    }
}

/// Validate the matrix configuration.
pub fn validate(path: &Path) -> Result<()> {
    let config = config::load(path)?;
    let plan = MatrixPlan::from_config(&config)?;

    println!(
        "{} {} is valid",
        style("✓").green(),
        style(path.display()).bold()
    );
    println!("  Package: {}", config.package);
    for axis in &config.axes {
        println!("    {} = [{}]", axis.name, axis.values.join(", "));
    }
    println!("  Backends: {}", config.backends.len());
    println!("  Exclusion rules: {}", config.exclude.len());
    println!(
        "  Jobs: {} of {} candidates",
        plan.len(),
        plan.candidates()
    );
    Ok(())
}

/// Print the resolved job matrix.
pub fn resolve(path: &Path, backends: &[String], json: bool) -> Result<()> {
    let config = load_scoped(path, backends)?;
    let plan = MatrixPlan::from_config(&config)?;

    if json {
        let combinations: Vec<_> = plan.combinations().collect();
        println!("{}", serde_json::to_string_pretty(&combinations)?);
        return Ok(());
    }

    for (index, combination) in plan.combinations().enumerate() {
        println!(
            "{:>4}  {}  {}",
            style(index).dim(),
            combination.display_name(),
            style(combination.tag()).cyan()
        );
    }
    println!(
        "{} {} jobs ({} excluded)",
        style("=").bold(),
        plan.len(),
        plan.candidates() - plan.len()
    );
    Ok(())
}

pub struct RunArgs {
    pub reference: GitRef,
    pub commit: String,
    pub target: String,
    pub changed_paths: Vec<String>,
    pub backends: Vec<String>,
    pub provisioner: Provisioner,
    pub workers: Option<Workers>,
}

/// Run the matrix for one trigger. Returns whether the gate passed.
pub async fn run(path: &Path, artifacts: &Path, args: RunArgs) -> Result<bool> {
    let mut config = load_scoped(path, &args.backends)?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    let config = Arc::new(config);

    let provisioner: Arc<dyn ServiceProvisioner> = match args.provisioner {
        Provisioner::Env => Arc::new(EnvProvisioner::from_env(config.services.clone())),
        Provisioner::Docker => Arc::new(
            DockerProvisioner::new(config.services.clone())
                .context("failed to connect to the container runtime")?,
        ),
    };
    let sink = Arc::new(FsArtifactSink::new(artifacts));
    let runner = Arc::new(JobRunner::from_config(&config, provisioner, sink.clone()));
    let bus = Arc::new(InMemoryEventBus::default());
    let dispatcher = Dispatcher::new(config, runner, sink.clone(), bus.clone())?;

    let mut events = bus.subscribe("trigger.>").await?;
    let printer = tokio::spawn(async move {
        while let Some(Ok(event)) = events.next().await {
            print_event(&event);
        }
    });

    let event = match &args.reference {
        GitRef::Branch(branch) => TriggerEvent::push(branch.clone(), args.commit),
        GitRef::PullRequest(number) => TriggerEvent::pull_request(*number, args.target, args.commit),
    }
    .with_changed_paths(args.changed_paths);

    let Some(handle) = dispatcher.submit(event).await? else {
        println!(
            "{} Trigger for {} filtered out; nothing to run",
            style("i").blue(),
            args.reference
        );
        printer.abort();
        return Ok(true);
    };

    println!(
        "{} Trigger {} on {}: {} jobs",
        style("▶").cyan(),
        style(handle.trigger_id).bold(),
        handle.reference,
        handle.jobs
    );

    let trigger_id = handle.trigger_id;
    let reference = handle.reference.clone();
    let gate = tokio::select! {
        gate = handle.wait() => gate,
        _ = tokio::signal::ctrl_c() => {
            dispatcher.cancel(&reference).await;
            println!("{} Trigger {} cancelled", style("✗").red(), trigger_id);
            printer.abort();
            return Ok(false);
        }
    };
    printer.abort();

    let gate = gate?;
    print_gate(&gate, &sink.scope_dir(ArtifactScope::Trigger(trigger_id)));
    Ok(gate.passed())
}

fn print_event(event: &Event) {
    match event {
        Event::JobStarted(p) => {
            println!("  {} job {} {}", style("…").dim(), p.index, p.tag);
        }
        Event::JobCompleted(p) => {
            let mark = match &p.outcome {
                JobOutcome::Passed => style("✓").green(),
                JobOutcome::Failed { .. } => style("✗").red(),
                JobOutcome::InfrastructureError { .. } => style("!").yellow(),
            };
            println!(
                "  {} job {} {} ({} ms) {}",
                mark,
                p.index,
                p.tag,
                p.duration_ms,
                style(&p.outcome).dim()
            );
        }
        Event::TriggerCancelled(p) => {
            println!("{} Trigger {} cancelled", style("✗").red(), p.trigger_id);
        }
        _ => {}
    }
}

fn print_gate(gate: &GateResult, artifacts: &Path) {
    let failed: Vec<_> = gate.failures().collect();
    if failed.is_empty() {
        println!(
            "{} Gate passed: {} jobs",
            style("✓").green().bold(),
            gate.entries.len()
        );
    } else {
        println!(
            "{} Gate failed: {} of {} jobs",
            style("✗").red().bold(),
            failed.len(),
            gate.entries.len()
        );
        for entry in failed {
            println!("    {} {}", entry.name, style(&entry.outcome).dim());
        }
    }
    println!("  Artifacts: {}", artifacts.display());
}

/// Build the package for a backend subset.
pub async fn build(
    path: &Path,
    artifacts: &Path,
    backends: &[String],
    check: bool,
    out: &Path,
    workers: Option<Workers>,
) -> Result<()> {
    let config = Arc::new(config::load(path)?);
    let spec = BuildSpec::new(backends.iter().cloned(), check)?;

    let mut settings = BuildSettings::new(out, std::env::current_dir()?);
    if let Some(workers) = workers {
        settings.workers = workers;
    }

    let sink = Arc::new(FsArtifactSink::new(artifacts));
    let builder = PackageBuilder::from_config(config, settings, sink);

    println!(
        "{} Building for {}{}",
        style("▶").cyan(),
        style(backends.join(", ")).bold(),
        if check { " with acceptance check" } else { "" }
    );

    let artifact = builder.build(&spec).await?;

    println!("{} Build {} accepted", style("✓").green(), artifact.id);
    if let Some(check) = &artifact.check {
        println!("  Check: {} ({} tests)", check.selection, check.total);
    }
    println!(
        "  Modules: {}",
        artifact
            .verified_modules
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("{}", artifact.manifest_path().display());
    Ok(())
}

/// Print the configuration JSON schema.
pub fn schema() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&MatrixConfig::json_schema())?);
    Ok(())
}
