//! Agent registry: maps friendly names to ACP launch commands.
//!
//! Built-ins cover the agents with a known ACP entry point; a TOML config
//! can add or override agents and declare MCP servers that are forwarded to
//! `session/new`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no agent specified; usage: ferry acp <agent> [args...] or ferry acp -- <command> [args...]")]
    NoAgent,
    #[error("missing command after --")]
    MissingCommand,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub agents: HashMap<String, AgentSpec>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl RegistryConfig {
    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|error| anyhow::anyhow!("failed to parse {}: {error}", path.display()))
    }
}

/// A fully resolved child invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentInvocation {
    pub command: String,
    pub args: Vec<String>,
    pub mcp_servers: Vec<Value>,
}

pub struct AgentRegistry {
    agents: HashMap<String, AgentSpec>,
    mcp_servers: Vec<McpServerConfig>,
}

impl AgentRegistry {
    pub fn builtin() -> Self {
        let mut agents = HashMap::new();
        agents.insert(
            "gemini".to_string(),
            AgentSpec {
                command: "gemini".to_string(),
                args: vec!["--experimental-acp".to_string()],
            },
        );
        agents.insert(
            "opencode".to_string(),
            AgentSpec {
                command: "opencode".to_string(),
                args: vec!["acp".to_string()],
            },
        );
        Self {
            agents,
            mcp_servers: Vec::new(),
        }
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        let mut registry = Self::builtin();
        registry.agents.extend(config.agents);
        registry.mcp_servers = config.mcp_servers;
        registry
    }

    /// Resolve a command line into an invocation.
    ///
    /// A leading `--` forces a literal spawn, skipping registry lookup.
    /// Unknown names are treated as the command itself.
    pub fn resolve(&self, args: &[String]) -> Result<AgentInvocation, ResolveError> {
        let Some((first, rest)) = args.split_first() else {
            return Err(ResolveError::NoAgent);
        };

        if first == "--" {
            let Some((command, pass_through)) = rest.split_first() else {
                return Err(ResolveError::MissingCommand);
            };
            return Ok(self.invocation(command.clone(), pass_through.to_vec()));
        }

        match self.agents.get(first) {
            Some(spec) => {
                let mut pass_through = rest.to_vec();
                if first == "opencode" {
                    // Older opencode wrappers passed --acp; the subcommand
                    // form supersedes it.
                    pass_through.retain(|arg| arg != "--acp");
                }
                let mut full_args = spec.args.clone();
                full_args.extend(pass_through);
                Ok(self.invocation(spec.command.clone(), full_args))
            }
            None => Ok(self.invocation(first.clone(), rest.to_vec())),
        }
    }

    fn invocation(&self, command: String, args: Vec<String>) -> AgentInvocation {
        AgentInvocation {
            command,
            args,
            mcp_servers: self
                .mcp_servers
                .iter()
                .map(|server| {
                    json!({
                        "name": server.name,
                        "command": server.command,
                        "args": server.args,
                        "env": server.env,
                    })
                })
                .collect(),
        }
    }
}
