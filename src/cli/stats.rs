// ABOUTME: CLI stats command - connection statistics and metrics snapshots
//
// Connects to each selected server, runs one tools/list as a sample, then
// reports the shared connection's counters and the server's metrics.

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::warn;

use super::query::ensure_connected;
use super::{OutputFormat, StatsArgs};
use tmux_agentic::mcp_client::{ConnectionStats, McpClient, MetricsSnapshot};

/// Report for one server
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub server: String,
    pub connection: ConnectionStats,
    pub metrics: Option<MetricsSnapshot>,
}

/// Execute the stats command
pub async fn execute(client: &McpClient, args: StatsArgs, format: OutputFormat) -> Result<()> {
    let servers = match args.server {
        Some(server) if client.has_server(&server) => vec![server],
        Some(server) => return Err(anyhow!("Unknown MCP server: {server}")),
        None => client.server_names(),
    };

    let mut reports = Vec::with_capacity(servers.len());
    for server in servers {
        reports.push(collect(client, &server).await?);
    }
    client.disconnect_all().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&reports)?),
        OutputFormat::Text => output_text(&reports)?,
    }
    Ok(())
}

/// Sample one server and gather its numbers
pub async fn collect(client: &McpClient, server: &str) -> Result<ServerReport> {
    match ensure_connected(client, server).await {
        Ok(()) => {
            if let Err(e) = client.list_tools(server).await {
                warn!(server = %server, error = %e, "Sample tools/list failed");
            }
        }
        Err(e) => warn!(server = %server, error = %e, "Could not connect for stats"),
    }

    Ok(ServerReport {
        server: server.to_string(),
        connection: client.connection_stats(server).await?,
        metrics: client.metrics_snapshot(server),
    })
}

fn output_text(reports: &[ServerReport]) -> Result<()> {
    if reports.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }

    for report in reports {
        println!("{}: {}", report.server, report.connection);
        if let Some(metrics) = &report.metrics {
            println!("{}", serde_json::to_string_pretty(metrics)?);
        }
    }
    Ok(())
}
