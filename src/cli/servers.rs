// ABOUTME: CLI servers command - list configured MCP servers
//
// Shows each registered server with its transport, endpoint and whether
// calls connect on demand.

use anyhow::Result;
use serde::Serialize;

use super::{truncate, OutputFormat};
use tmux_agentic::mcp_client::{McpClient, ServerConfig, TransportKind};

/// One row of the server listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerRow {
    pub name: String,
    pub transport: &'static str,
    pub endpoint: String,
    pub auto_start: bool,
}

impl ServerRow {
    /// Describe a server config for display
    #[must_use]
    pub fn from_config(config: &ServerConfig) -> Self {
        let endpoint = match &config.transport {
            TransportKind::Socket { path } => path.display().to_string(),
            TransportKind::Stdio { command, args, .. } => {
                std::iter::once(command.as_str())
                    .chain(args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" ")
            }
        };

        Self {
            name: config.name.clone(),
            transport: config.transport.label(),
            endpoint,
            auto_start: config.auto_start,
        }
    }
}

/// Rows for every registered server, sorted by name
#[must_use]
pub fn server_rows(client: &McpClient) -> Vec<ServerRow> {
    client
        .server_names()
        .iter()
        .filter_map(|name| client.server_config(name))
        .map(|config| ServerRow::from_config(&config))
        .collect()
}

/// Execute the servers command
pub fn execute(client: &McpClient, format: OutputFormat) -> Result<()> {
    let rows = server_rows(client);

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Text => output_text(&rows),
    }
    Ok(())
}

fn output_text(rows: &[ServerRow]) {
    if rows.is_empty() {
        println!("No MCP servers configured.");
        return;
    }

    println!("{:<20} {:<8} {:<6} ENDPOINT", "NAME", "TYPE", "AUTO");
    println!("{}", "-".repeat(80));
    for row in rows {
        println!(
            "{:<20} {:<8} {:<6} {}",
            truncate(&row.name, 20),
            row.transport,
            if row.auto_start { "yes" } else { "no" },
            truncate(&row.endpoint, 44)
        );
    }
}
