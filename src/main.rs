//! cli-quest - sandboxed terminal server for CLI Quest.
//!
//! Usage:
//!   cli-quest serve [--port 8000] [--backend native|mock]
//!   cli-quest run [--backend native|mock] -- <command> [args]

use anyhow::Context;
use clap::Parser;
use cli_quest::challenges::ChallengeCatalog;
use cli_quest::config::{Cli, Commands, RunArgs, ServeArgs};
use cli_quest::sandbox::EnvironmentFactory;
use cli_quest::{http_server, telemetry, AppState, SessionRegistry};
use std::sync::Arc;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.log_json, Level::INFO);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Run(args) => run_once(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let catalog = match &args.challenges {
        Some(path) => ChallengeCatalog::load(path)?,
        None => ChallengeCatalog::builtin()?,
    };
    info!(challenges = catalog.len(), "Challenge catalog loaded");

    let backend = args.sandbox.backend()?;
    info!(backend = backend.kind(), "Sandbox backend ready");
    let factory = EnvironmentFactory::new(args.sandbox.environment_config(), args.sandbox.policy(), backend);
    let registry = Arc::new(SessionRegistry::new(factory, args.registry_settings()));

    let state = AppState::new(registry, catalog);
    http_server::run_server(args.addr(), state, &args.allowed_origins).await
}

async fn run_once(args: RunArgs) -> anyhow::Result<()> {
    let factory = EnvironmentFactory::new(
        args.sandbox.environment_config(),
        args.sandbox.policy(),
        args.sandbox.backend()?,
    );
    let environment = factory.environment(&format!("run-{}", std::process::id()));
    let command = args.command.join(" ");

    let output = tokio::task::spawn_blocking(move || {
        let result = environment.initialize().and_then(|()| environment.execute(&command));
        environment.cleanup();
        result
    })
    .await
    .context("sandbox task failed")??;

    println!("{}", output);
    Ok(())
}
