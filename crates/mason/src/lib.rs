#![deny(unreachable_pub)]

//! mason: a small build orchestrator driving elements through a parallel
//! track → fetch → build → push pipeline of isolated worker processes.

pub mod actions;
pub mod cli;
pub mod element;
pub mod frontend;
pub mod project;
pub mod queues;
pub mod stream;

#[cfg(test)]
pub(crate) mod testutil;

use clap::Parser as _;

use mason_core::context::Context;
use mason_core::item::Consistency;
use mason_sched::{RunOutcome, SchedulerConfig, WorkerLauncher};

use crate::cli::{Cli, Command};
use crate::project::Project;
use crate::stream::{Stream, StreamError};

/// Process entrypoint: parse the command line, divert the hidden worker
/// subcommand before any runtime exists, and run the session.
pub fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The worker never enters the async runtime: it is a plain blocking
    // process speaking frames on stdin/stdout.
    if matches!(cli.command, Command::Worker) {
        actions::run_worker_process();
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(cli))
}

/// Run a parsed CLI invocation (everything except the worker subcommand).
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let context = Context::new();
    context.set_silent(cli.silent);
    frontend::install(&context, cli.silent);

    let project = Project::load(&cli.project)?;

    let mut config = SchedulerConfig::new(WorkerLauncher::current_exe()?);
    config.fetchers = cli.fetchers;
    config.builders = cli.builders;
    config.pushers = cli.pushers;
    config.on_error = cli.on_error.into();
    config.silent_messages = cli.silent;
    config.log_dir = Some(project.dirs().logs.clone());

    if !cli.silent {
        eprintln!(
            "mason {} project {} started {}",
            env!("CARGO_PKG_VERSION"),
            project.name(),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        );
    }

    let stream = Stream::new(project.clone(), context.clone(), config, cli.max_retries);

    match cli.command {
        Command::Track { targets } => finish(stream.track(&targets).await),
        Command::Fetch { targets, track } => finish(stream.fetch(&targets, track).await),
        Command::Build { targets, track } => finish(stream.build(&targets, track).await),
        Command::Pull { targets } => finish(stream.pull(&targets).await),
        Command::Push { targets } => finish(stream.push(&targets).await),
        Command::Checkout {
            target,
            directory,
            force,
        } => stream.checkout(&target, &directory, force),
        Command::Show { targets } => show(&project, &targets),
        Command::Worker => unreachable!("the worker subcommand is handled in main"),
    }
}

/// Render the session summary whether the stream succeeded or raised, then
/// propagate the error.
fn finish(result: anyhow::Result<RunOutcome>) -> anyhow::Result<()> {
    match result {
        Ok(outcome) => {
            frontend::print_summary(&outcome);
            Ok(())
        }
        Err(err) => {
            if let Some(stream_err) = err.downcast_ref::<StreamError>() {
                frontend::print_summary(stream_err.outcome());
            }
            Err(err)
        }
    }
}

fn show(project: &Project, targets: &[String]) -> anyhow::Result<()> {
    let plan = project.plan(targets, crate::element::Scope::All)?;
    for element in plan {
        let consistency = match element.consistency() {
            Consistency::Inconsistent => "inconsistent",
            Consistency::Resolved => "resolved",
            Consistency::Cached => "cached",
        };
        let key = element
            .cache_key()
            .map(|key| key[..12].to_string())
            .unwrap_or_else(|| "-".to_string());
        let artifact = if element.artifact_cached() { "built" } else { "-" };
        println!("{:<24} {:<13} {:<13} {}", element.name(), consistency, key, artifact);
    }
    Ok(())
}
