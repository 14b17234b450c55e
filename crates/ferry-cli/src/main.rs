use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

mod agents;
mod cli;
mod relay;
mod runner;

use agents::{AgentRegistry, RegistryConfig};
use cli::{Cli, Commands};
use relay::LocalRelay;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout belongs to the envelope stream.
    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init()
        .ok();

    match cli.command {
        Commands::Acp { agent, config } => {
            let registry = match config {
                Some(path) => AgentRegistry::with_config(RegistryConfig::from_toml_file(&path)?),
                None => AgentRegistry::builtin(),
            };
            let invocation = match registry.resolve(&agent) {
                Ok(invocation) => invocation,
                Err(error) => {
                    eprintln!("error: {error}");
                    std::process::exit(2);
                }
            };

            let relay = Arc::new(LocalRelay::spawn());
            let code = runner::run(
                relay,
                runner::RunnerOptions {
                    invocation,
                    working_dir: std::env::current_dir()?,
                    verbose: cli.verbose,
                    bridge_url: std::env::var("FERRY_BRIDGE_URL").ok(),
                },
            )
            .await?;
            std::process::exit(code);
        }
    }
}
