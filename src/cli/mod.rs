// ABOUTME: CLI argument parsing and command routing for tmux-agentic
//
// Provides command-line interface for:
// - Listing configured MCP servers (servers)
// - Calling tools with reconnect-and-retry (query)
// - Listing tools and resources, reading a resource (tools, resources, read)
// - Connection and metrics reporting (stats)

pub mod query;
pub mod servers;
pub mod stats;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use tmux_agentic::mcp_client::config::{default_servers_path, load_servers_from_file};
use tmux_agentic::mcp_client::{ClientConfig, McpClient};

/// Talk to MCP servers from the command line
#[derive(Parser)]
#[command(name = "tmux-agentic")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Server list (JSON with an mcpServers object); defaults to ~/.claude.json
    #[arg(long, global = true)]
    pub servers: Option<PathBuf>,

    /// Client tunables (TOML); defaults to ~/.tmux-agentic/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Write JSON logs under ~/.tmux-agentic/logs instead of stderr
    #[arg(long, global = true)]
    pub log_file: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

/// Output format for commands
#[derive(Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// List configured servers and their transports
    Servers,

    /// Call a tool, reconnecting once on failure
    Query(QueryArgs),

    /// List a server's tools
    Tools(ServerArgs),

    /// List a server's resources
    Resources(ServerArgs),

    /// Read one resource
    Read(ReadArgs),

    /// Connection statistics and metrics
    Stats(StatsArgs),
}

/// Arguments for the query command
#[derive(clap::Args)]
pub struct QueryArgs {
    /// Server name
    pub server: String,

    /// Tool name
    pub tool: String,

    /// Tool arguments as a JSON object
    pub arguments: Option<String>,
}

/// Arguments naming a single server
#[derive(clap::Args)]
pub struct ServerArgs {
    /// Server name
    pub server: String,
}

/// Arguments for the read command
#[derive(clap::Args)]
pub struct ReadArgs {
    /// Server name
    pub server: String,

    /// Resource URI
    pub uri: String,
}

/// Arguments for the stats command
#[derive(clap::Args)]
pub struct StatsArgs {
    /// Only this server; all servers when omitted
    pub server: Option<String>,
}

/// Build a client from the configured server list and tunables
pub fn build_client(cli: &Cli) -> Result<Arc<McpClient>> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(ClientConfig::default_path);
    let config = ClientConfig::load(&config_path)
        .with_context(|| format!("Failed to load client config {}", config_path.display()))?;

    let servers_path = cli.servers.clone().unwrap_or_else(default_servers_path);
    let servers = load_server_list(&servers_path)?;
    debug!(path = %servers_path.display(), count = servers.len(), "Loaded server list");

    Ok(Arc::new(McpClient::from_servers(config, servers)))
}

fn load_server_list(path: &Path) -> Result<Vec<tmux_agentic::mcp_client::ServerConfig>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    load_servers_from_file(path).with_context(|| format!("Failed to load servers from {}", path.display()))
}

/// Truncate a string to fit in the given width (character-aware for UTF-8)
pub fn truncate(s: &str, max_len: usize) -> String {
    if max_len <= 3 {
        return ".".repeat(max_len);
    }
    let char_count = s.chars().count();
    if char_count <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}
