// ABOUTME: tracing subscriber setup for the tmux-agentic binary
//
// With a log file: JSON lines under ~/.tmux-agentic/logs/. Without: plain
// text on stderr so stdout stays clean for command output.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "tmux_agentic=info";

/// Directory holding the JSONL log files
#[must_use]
pub fn log_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".tmux-agentic").join("logs"))
        .unwrap_or_else(|| PathBuf::from(".tmux-agentic/logs"))
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

/// Install the global subscriber. Returns the log file path when logging
/// to a file.
pub fn init_tracing(to_file: bool) -> Result<Option<PathBuf>> {
    if !to_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .with(env_filter())
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(None);
    }

    let dir = log_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let path = dir.join(format!(
        "tmux-agentic-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to create log file {}", path.display()))?;

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_writer(file)
                .with_ansi(false),
        )
        .with(env_filter())
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(Some(path))
}
