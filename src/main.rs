// ABOUTME: Main entry point for tmux-agentic, a command-line MCP client
//
// Binary: tmux-agentic
// Usage: tmux-agentic [--servers PATH] [--config PATH] [--log-file] COMMAND
// - servers: list configured MCP servers
// - query: call a tool with reconnect-and-retry
// - tools / resources / read: listing and resource access
// - stats: connection statistics and metrics

#![allow(missing_docs)]

use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let log_path = tmux_agentic::logging::init_tracing(args.log_file)?;
    setup_panic_handler();
    if let Some(path) = log_path {
        tracing::info!(path = %path.display(), "Logging to file");
    }

    let client = cli::build_client(&args)?;
    let format = args.format;

    let result = match args.command {
        Commands::Servers => cli::servers::execute(&client, format),
        Commands::Query(query_args) => cli::query::execute(&client, query_args, format).await,
        Commands::Tools(server_args) => cli::query::tools(&client, server_args, format).await,
        Commands::Resources(server_args) => cli::query::resources(&client, server_args, format).await,
        Commands::Read(read_args) => cli::query::read(&client, read_args, format).await,
        Commands::Stats(stats_args) => cli::stats::execute(&client, stats_args, format).await,
    };

    client.disconnect_all().await;
    result
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {panic_info}");
    }));
}
