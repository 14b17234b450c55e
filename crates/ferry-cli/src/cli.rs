use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ferry", version)]
#[command(about = "Remote-control bridge for ACP coding agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log raw agent-messages to stdout in addition to envelopes
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Launch an ACP agent and bridge its session updates
    Acp {
        /// Agent name (gemini, opencode, ...) with pass-through args, or a
        /// literal command line after `--`
        #[arg(
            trailing_var_arg = true,
            allow_hyphen_values = true,
            value_name = "AGENT"
        )]
        agent: Vec<String>,

        /// TOML file defining extra agents and MCP servers
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}
