// ABOUTME: Error taxonomy for the MCP client subsystem
//
// Transport establishment (connect/spawn), I/O outcomes (timeout, EOF),
// protocol failures (malformed payloads, handshake) and registry errors
// (unknown server, capacity) all surface as McpError. Dispatcher-only
// failures live in DispatchError.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced by transports, connections, the client registry and the pool
#[derive(Error, Debug)]
pub enum McpError {
    /// Unix socket could not be reached
    #[error("Failed to connect to socket {path}: {source}")]
    Connect {
        /// Socket path that was attempted
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Child process could not be launched
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        /// Executable that failed to start
        command: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// No complete message arrived within the bound
    #[error("Timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    /// Peer closed the channel
    #[error("Connection closed by server")]
    Eof,

    /// Payload was not a usable response envelope
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Target name is not registered
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// No idle or creatable connection
    #[error("Connection pool exhausted for server {0}")]
    PoolExhausted(String),

    /// Handshake failed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Retries exhausted
    #[error("Server {server} unreachable after {attempts} attempts: {reason}")]
    Unreachable {
        /// Server name
        server: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Last failure observed
        reason: String,
    },

    /// Operation requires an established connection
    #[error("Server {0} is not connected")]
    NotConnected(String),

    /// Registry is full
    #[error("Maximum number of servers ({0}) reached")]
    TooManyServers(usize),

    /// Name already registered
    #[error("Server already registered: {0}")]
    DuplicateServer(String),

    /// Buffered data exceeded the frame limit without a newline
    #[error("Message exceeds maximum size of {0} bytes")]
    MessageTooLarge(usize),

    /// Other I/O failure on an established channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl McpError {
    /// Short stable label, used as the error type in metrics
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Spawn { .. } => "spawn",
            Self::Timeout(_) => "timeout",
            Self::Eof => "eof",
            Self::MalformedResponse(_) => "malformed_response",
            Self::ServerNotFound(_) => "server_not_found",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::Protocol(_) => "protocol",
            Self::Unreachable { .. } => "unreachable",
            Self::NotConnected(_) => "not_connected",
            Self::TooManyServers(_) => "too_many_servers",
            Self::DuplicateServer(_) => "duplicate_server",
            Self::MessageTooLarge(_) => "message_too_large",
            Self::Io(_) => "io",
        }
    }

    /// True for failures of the underlying channel, after which the
    /// connection must be re-established before further use
    #[must_use]
    pub const fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::Eof | Self::Io(_) | Self::MessageTooLarge(_) | Self::NotConnected(_)
        )
    }
}

/// Result alias for MCP client operations
pub type McpResult<T> = Result<T, McpError>;

/// Errors returned by dispatcher control operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Request is unknown or already terminal
    #[error("Request {0} not found or already finished")]
    NotFound(u64),

    /// Request is mid-send and cannot be cancelled
    #[error("Request {0} is being sent and cannot be cancelled")]
    NotCancellable(u64),
}
