// ABOUTME: MCP client for talking to Model Context Protocol servers
//
// Servers are reached either over a Unix domain socket or by spawning a
// process and speaking over its stdin/stdout. Messages are newline
// delimited JSON-RPC 2.0.
//
// Key components:
// - transport: socket/process channel with buffered line framing
// - connection: per-server state machine, counters, id-matched responses
// - protocol: envelopes, response parsing, handshake, connect-with-retry
// - client: server registry and the tool invocation API
// - pool: bounded per-server connection pool
// - dispatcher: priority queues, concurrency caps, timeouts, cancellation
// - metrics: latency percentiles, error tallies, throughput

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod transport;

#[cfg(test)]
mod test_server;

// Re-exports for convenient access
pub use client::{McpClient, Operation};
pub use config::{ClientConfig, ServerConfig, TransportKind, MAX_SERVERS};
pub use connection::{Connection, ConnectionState, ConnectionStats};
pub use dispatcher::{
    AsyncDispatcher, Callback, DispatcherStats, Priority, RequestId, RequestInfo, RequestOutcome,
    RequestState,
};
pub use error::{DispatchError, McpError, McpResult};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use protocol::Response;
