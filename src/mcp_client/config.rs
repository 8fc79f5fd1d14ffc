// ABOUTME: Configuration for the MCP client: server records and tunables
//
// Defines:
// - ServerConfig / TransportKind: immutable per-server records
// - ClientConfig: timeouts, retry policy, pool and dispatcher limits (TOML)
// - load_servers_from_file: reads the `mcpServers` map of ~/.claude.json

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Registry capacity per client
pub const MAX_SERVERS: usize = 16;

/// Errors raised while reading configuration files
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File that was read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Server list was not valid JSON
    #[error("Invalid server list in {path}: {source}")]
    Json {
        /// File that was parsed
        path: PathBuf,
        /// Parse error
        #[source]
        source: serde_json::Error,
    },

    /// Client settings were not valid TOML
    #[error("Invalid client config in {path}: {source}")]
    Toml {
        /// File that was parsed
        path: PathBuf,
        /// Parse error
        #[source]
        source: toml::de::Error,
    },
}

/// How a server is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportKind {
    /// Unix domain socket at a fixed path
    Socket {
        /// Socket path
        path: PathBuf,
    },

    /// Child process speaking newline-delimited JSON over stdin/stdout
    Stdio {
        /// Executable
        command: String,
        /// Arguments
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment for the child
        #[serde(default)]
        env: HashMap<String, String>,
    },
}

impl TransportKind {
    /// Short label for reporting
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Socket { .. } => "socket",
            Self::Stdio { .. } => "stdio",
        }
    }
}

/// Immutable record describing one named server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique registry key
    pub name: String,

    /// Transport binding
    pub transport: TransportKind,

    /// Connect on demand when a call finds the server disconnected
    #[serde(default)]
    pub auto_start: bool,
}

impl ServerConfig {
    /// Server reached through a Unix socket
    pub fn socket(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            transport: TransportKind::Socket { path: path.into() },
            auto_start: false,
        }
    }

    /// Server spawned as a child process
    pub fn stdio<I, S>(name: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            transport: TransportKind::Stdio {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
            },
            auto_start: true,
        }
    }

    /// Override the auto-start flag
    #[must_use]
    pub const fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }
}

/// Connection retry policy (exponential backoff)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Connect+initialize attempts before giving up
    pub max_attempts: u32,

    /// First backoff delay, doubled per attempt
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Backoff cap
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Per-server pool limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum connections per server
    pub max_size: usize,

    /// Idle entries older than this are evicted by cleanup
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 5,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Async dispatcher limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// In-flight requests allowed per server
    pub max_concurrent_per_server: usize,

    /// Timeout applied when a submission does not specify one
    #[serde(with = "duration_millis")]
    pub default_timeout: Duration,

    /// Slice length for wait_all
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Delay before redraining after the pool reported exhaustion
    #[serde(with = "duration_millis")]
    pub requeue_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_server: 5,
            default_timeout: Duration::from_millis(30_000),
            poll_interval: Duration::from_millis(100),
            requeue_delay: Duration::from_millis(50),
        }
    }
}

/// Client-wide tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Registry capacity
    pub max_servers: usize,

    /// Bound on a single receive
    #[serde(with = "duration_millis")]
    pub receive_timeout: Duration,

    /// Connection establishment retries
    pub retry: RetryPolicy,

    // === Staleness ===
    /// Idle time after which a connection is considered stale
    #[serde(with = "duration_secs")]
    pub stale_idle_timeout: Duration,

    /// Lifetime error ratio above which a connection is considered stale
    pub stale_error_rate: f64,

    /// Pool limits
    pub pool: PoolSettings,

    /// Dispatcher limits
    pub dispatcher: DispatcherConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_servers: MAX_SERVERS,
            receive_timeout: Duration::from_millis(5000),
            retry: RetryPolicy::default(),
            stale_idle_timeout: Duration::from_secs(300),
            stale_error_rate: 0.5,
            pool: PoolSettings::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load settings from a TOML file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "No client config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Default settings location: ~/.tmux-agentic/config.toml
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tmux-agentic")
            .join("config.toml")
    }
}

// === Server list (~/.claude.json) ===

#[derive(Debug, Deserialize)]
struct ServersFile {
    #[serde(rename = "mcpServers", default)]
    mcp_servers: BTreeMap<String, ServerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerEntry {
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    socket: Option<PathBuf>,
    auto_start: Option<bool>,
}

impl ServerEntry {
    fn into_config(self, name: String) -> Option<ServerConfig> {
        let (transport, default_auto_start) = match (self.command, self.socket) {
            (Some(command), _) => (
                TransportKind::Stdio {
                    command,
                    args: self.args,
                    env: self.env,
                },
                true,
            ),
            (None, Some(path)) => (TransportKind::Socket { path }, false),
            (None, None) => return None,
        };

        Some(ServerConfig {
            name,
            transport,
            auto_start: self.auto_start.unwrap_or(default_auto_start),
        })
    }
}

/// Parse the `mcpServers` map from JSON text, sorted by name
pub fn parse_servers(content: &str) -> Result<Vec<ServerConfig>, serde_json::Error> {
    let file: ServersFile = serde_json::from_str(content)?;

    let servers = file
        .mcp_servers
        .into_iter()
        .filter_map(|(name, entry)| {
            let config = entry.into_config(name.clone());
            if config.is_none() {
                warn!(server = %name, "Skipping MCP server with neither command nor socket");
            }
            config
        })
        .collect();

    Ok(servers)
}

/// Load server records from a JSON file such as ~/.claude.json
pub fn load_servers_from_file(path: &Path) -> Result<Vec<ServerConfig>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let servers = parse_servers(&content).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    debug!(path = %path.display(), count = servers.len(), "Loaded MCP server list");
    Ok(servers)
}

/// Default server list location: ~/.claude.json
#[must_use]
pub fn default_servers_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude.json")
}

/// Serde helper for Duration as seconds (u64)
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Serde helper for Duration as milliseconds (u64)
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
