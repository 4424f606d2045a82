use std::path::PathBuf;

use clap::{Parser, Subcommand};

use fleet_supervisor::serve::{DEFAULT_BIND, DEFAULT_PORT};

/// Supervisor and multiplexing gateway for MCP tool servers.
#[derive(Parser)]
#[command(name = "mcp-fleet", version)]
pub struct Cli {
    /// Control-plane port
    #[arg(long, global = true, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor and HTTP control plane until /kill or SIGINT/SIGTERM
    Serve {
        /// Bind address (Docker deployments rebind 0.0.0.0)
        #[arg(long, default_value = DEFAULT_BIND)]
        bind: String,

        /// Fleet config path (defaults to mcp_servers.json beside the binary)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Fetch /status from a running instance and pretty-print it
    Status,

    /// Fetch /tools from a running instance and pretty-print it
    Tools,

    /// Start one child, or all of them
    Start {
        /// Child name, or "all"
        target: String,
    },

    /// Stop one child, or all of them
    Stop {
        /// Child name, or "all"
        target: String,
    },

    /// Stop all children and shut the running instance down
    Kill,
}
