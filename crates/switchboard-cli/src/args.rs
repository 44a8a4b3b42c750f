//! CLI argument definitions using clap
//!
//! Every subcommand maps onto one router operation; `serve` runs the
//! long-lived mode that reads operation envelopes from stdin.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(about = "Switchboard - dynamic MCP server proxy router")]
#[command(version)]
pub struct Cli {
    /// State directory (default: ~/.switchboard)
    #[arg(long, global = true, env = "SWITCHBOARD_HOME")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered servers and their state
    List,

    /// Search server names, descriptions, and tool names
    Search {
        query: String,
        /// Start every enabled server that matches
        #[arg(long)]
        auto_start: bool,
    },

    /// Show full detail on one server
    Describe { server: String },

    /// List known tools, live or cached
    Tools {
        /// Limit to one server
        server: Option<String>,
    },

    /// Show running servers and totals
    Status,

    /// Proxy one tool call
    Call {
        tool: String,
        /// Owning server; omit to resolve by tool name
        #[arg(long)]
        server: Option<String>,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },

    /// Start a server
    Start { server: String },

    /// Stop a running server
    Stop { server: String },

    /// Restart a server
    Restart { server: String },

    /// Enable a server
    Enable { server: String },

    /// Disable a server (running instances are left to idle out)
    Disable { server: String },

    /// Register a new server
    Register {
        server: String,
        /// Command to spawn (stdio transport)
        #[arg(long, conflicts_with = "url")]
        command: Option<String>,
        /// Arguments for the spawned command
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Environment entries, KEY=VALUE
        #[arg(long = "env")]
        env: Vec<String>,
        /// Endpoint URL (http transport)
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Tags, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Start this server at boot
        #[arg(long)]
        auto_start: bool,
    },

    /// Stop and remove a server
    Unregister { server: String },

    /// Re-read servers.yaml and hooks.yaml
    Reload,

    /// Scan a directory for server candidates
    Discover { path: PathBuf },

    /// Per-project call counters
    Usage,

    /// Process memory per running server
    Memory,

    /// Long-lived mode: auto-start servers, run the idle reaper, and
    /// answer JSON operation envelopes on stdin
    Serve,
}
