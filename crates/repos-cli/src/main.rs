//! The `repos` binary.

mod cli;
mod commands;
mod printer;
mod trace;

use std::sync::Arc;

use clap::Parser;
use repos_core::Repo;
use repos_engine::{Result, ToolRegistry};
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, Commands};
use crate::commands::build::BuildOptions;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    trace::init(cli.level, !cli.script);
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let code = match run(cli, &cancel).await {
        Ok(code) => code,
        Err(e) => {
            printer::print_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli, cancel: &CancellationToken) -> Result<i32> {
    let mut repo = Repo::discover(cli.chdir.as_deref())?;
    repo.load_projects()?;
    let registry = Arc::new(ToolRegistry::builtin());

    match cli.command {
        Commands::Projects => commands::projects::execute(&repo)?,
        Commands::Targets { patterns } => commands::targets::execute(&repo, &patterns)?,
        Commands::Check => commands::check::execute(&repo, &registry)?,
        Commands::Status { target } => commands::status::execute(&repo, &target)?,
        Commands::Log { target } => commands::log::execute(&repo, &target)?,
        Commands::Build {
            force,
            quiet,
            targets,
        } => {
            commands::build::execute(
                &repo,
                &registry,
                cancel,
                &targets,
                BuildOptions { force, quiet },
            )
            .await?;
        }
        Commands::Run { target, args } => {
            return commands::run::execute(&repo, &registry, cancel, &target, &args).await;
        }
    }
    Ok(0)
}

/// First interrupt cancels the run; a second one exits immediately.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_interrupt().await;
        cancel.cancel();
        wait_for_interrupt().await;
        std::process::exit(1);
    });
}

#[cfg(unix)]
async fn wait_for_interrupt() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_interrupt() {
    let _ = tokio::signal::ctrl_c().await;
}
