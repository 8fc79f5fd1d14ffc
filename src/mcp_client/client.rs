// ABOUTME: MCP client registry and tool invocation API
//
// An McpClient is an explicit value (typically shared as Arc<McpClient>)
// holding up to 16 named servers, one shared Connection per server and the
// per-server metrics. It offers:
// - call_tool / list_tools / list_resources / read_resource (basic path)
// - call_tool_safe: stale check, retrying connect, one reconnect-and-retry
// - open_connection: fresh connections for the pool

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::{ClientConfig, ServerConfig};
use super::connection::{Connection, ConnectionState, ConnectionStats};
use super::error::{McpError, McpResult};
use super::metrics::{MetricsRegistry, MetricsSnapshot};
use super::protocol::{self, Response};

/// A request the client knows how to send
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// tools/call
    CallTool {
        /// Tool name
        tool: String,
        /// Tool arguments; an empty object when absent
        arguments: Option<Value>,
    },
    /// tools/list
    ListTools,
    /// resources/list
    ListResources,
    /// resources/read
    ReadResource {
        /// Resource URI
        uri: String,
    },
}

impl Operation {
    /// Shorthand for a tool call
    pub fn call_tool(tool: impl Into<String>, arguments: Option<Value>) -> Self {
        Self::CallTool {
            tool: tool.into(),
            arguments,
        }
    }

    /// JSON-RPC method name
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::CallTool { .. } => "tools/call",
            Self::ListTools => "tools/list",
            Self::ListResources => "resources/list",
            Self::ReadResource { .. } => "resources/read",
        }
    }

    /// Request parameters
    #[must_use]
    pub fn params(&self) -> Option<Value> {
        match self {
            Self::CallTool { tool, arguments } => Some(json!({
                "name": tool,
                "arguments": arguments.clone().unwrap_or_else(|| json!({})),
            })),
            Self::ReadResource { uri } => Some(json!({ "uri": uri })),
            Self::ListTools | Self::ListResources => None,
        }
    }

    /// Tool name for tool calls, method name otherwise
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::CallTool { tool, .. } => tool,
            other => other.method(),
        }
    }
}

#[derive(Clone)]
struct ServerEntry {
    config: Arc<ServerConfig>,
    connection: Arc<Mutex<Connection>>,
}

/// Registry of MCP servers and their shared connections
pub struct McpClient {
    config: ClientConfig,
    servers: RwLock<HashMap<String, ServerEntry>>,
    metrics: MetricsRegistry,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("servers", &self.server_names())
            .finish_non_exhaustive()
    }
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl McpClient {
    /// Empty registry
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            servers: RwLock::new(HashMap::new()),
            metrics: MetricsRegistry::new(),
        }
    }

    /// Registry pre-filled from a server list; entries past the cap or
    /// with duplicate names are skipped
    #[must_use]
    pub fn from_servers(config: ClientConfig, servers: impl IntoIterator<Item = ServerConfig>) -> Self {
        let client = Self::new(config);
        for server in servers {
            let name = server.name.clone();
            if let Err(e) = client.add_server(server) {
                warn!(server = %name, error = %e, "Skipping MCP server");
            }
        }
        client
    }

    /// Client tunables
    #[must_use]
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Per-server metrics
    #[must_use]
    pub const fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    fn read_servers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ServerEntry>> {
        self.servers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_servers(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ServerEntry>> {
        self.servers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register a server
    ///
    /// # Errors
    /// `DuplicateServer` if the name exists, `TooManyServers` at capacity
    pub fn add_server(&self, config: ServerConfig) -> McpResult<()> {
        let mut servers = self.write_servers();

        if servers.contains_key(&config.name) {
            return Err(McpError::DuplicateServer(config.name));
        }
        if servers.len() >= self.config.max_servers {
            return Err(McpError::TooManyServers(self.config.max_servers));
        }

        info!(
            server = %config.name,
            transport = config.transport.label(),
            auto_start = config.auto_start,
            "Registered MCP server"
        );

        let config = Arc::new(config);
        let connection = Arc::new(Mutex::new(Connection::new(Arc::clone(&config))));
        servers.insert(config.name.clone(), ServerEntry { config, connection });
        Ok(())
    }

    /// Unregister a server and close its shared connection
    ///
    /// # Errors
    /// `ServerNotFound` for unknown names
    pub async fn remove_server(&self, name: &str) -> McpResult<()> {
        let entry = self
            .write_servers()
            .remove(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;

        entry.connection.lock().await.disconnect();
        info!(server = %name, "Removed MCP server");
        Ok(())
    }

    /// True if `name` is registered
    #[must_use]
    pub fn has_server(&self, name: &str) -> bool {
        self.read_servers().contains_key(name)
    }

    /// Registered names, sorted
    #[must_use]
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_servers().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered servers
    #[must_use]
    pub fn server_count(&self) -> usize {
        self.read_servers().len()
    }

    /// Shared record for `name`
    #[must_use]
    pub fn server_config(&self, name: &str) -> Option<Arc<ServerConfig>> {
        self.read_servers().get(name).map(|e| Arc::clone(&e.config))
    }

    /// Shared connection for `name`
    ///
    /// # Errors
    /// `ServerNotFound` for unknown names
    pub fn connection(&self, name: &str) -> McpResult<Arc<Mutex<Connection>>> {
        self.read_servers()
            .get(name)
            .map(|e| Arc::clone(&e.connection))
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))
    }

    // === Connection management ===

    /// Open the shared connection and attempt the handshake once
    pub async fn connect_server(&self, name: &str) -> McpResult<()> {
        let connection = self.connection(name)?;
        let mut conn = connection.lock().await;
        self.open_basic(&mut conn).await
    }

    /// Connect and initialize the shared connection with backoff
    pub async fn connect_with_retry(&self, name: &str) -> McpResult<()> {
        let connection = self.connection(name)?;
        let mut conn = connection.lock().await;
        self.reconnect(&mut conn).await
    }

    /// Close the shared connection
    pub async fn disconnect_server(&self, name: &str) -> McpResult<()> {
        let connection = self.connection(name)?;
        connection.lock().await.disconnect();
        Ok(())
    }

    /// Close every shared connection
    pub async fn disconnect_all(&self) {
        let connections: Vec<_> = self
            .read_servers()
            .values()
            .map(|e| Arc::clone(&e.connection))
            .collect();
        for connection in connections {
            connection.lock().await.disconnect();
        }
    }

    /// A new connected and initialized connection, independent of the
    /// shared one
    pub async fn open_connection(&self, name: &str) -> McpResult<Connection> {
        let config = self
            .server_config(name)
            .ok_or_else(|| McpError::ServerNotFound(name.to_string()))?;
        let mut conn = Connection::new(config);
        self.reconnect(&mut conn).await?;
        Ok(conn)
    }

    /// Counters of the shared connection
    pub async fn connection_stats(&self, name: &str) -> McpResult<ConnectionStats> {
        let connection = self.connection(name)?;
        let conn = connection.lock().await;
        Ok(conn.stats())
    }

    /// Metrics snapshot for `name`
    #[must_use]
    pub fn metrics_snapshot(&self, name: &str) -> Option<MetricsSnapshot> {
        self.metrics.snapshot(name)
    }

    /// Connect with retry, then a best-effort handshake
    async fn open_basic(&self, conn: &mut Connection) -> McpResult<()> {
        let was_used = conn.state() != ConnectionState::Disconnected || conn.requests_sent() > 0;
        if let Err(e) = protocol::open_with_retry(conn, &self.config.retry).await {
            self.metrics.with_server(conn.name(), |m| m.record_error(e.kind()));
            return Err(e);
        }
        self.note_connected(conn.name(), was_used);

        if !conn.is_initialized() {
            if let Err(e) = protocol::initialize(conn, self.config.receive_timeout).await {
                if e.is_transport_failure() {
                    return Err(e);
                }
                warn!(server = %conn.name(), error = %e, "MCP handshake failed, continuing uninitialized");
            }
        }
        Ok(())
    }

    /// connect_with_retry plus metrics bookkeeping
    async fn reconnect(&self, conn: &mut Connection) -> McpResult<()> {
        let was_used = conn.state() != ConnectionState::Disconnected || conn.requests_sent() > 0;
        let result = protocol::connect_with_retry(conn, &self.config.retry, self.config.receive_timeout).await;
        match &result {
            Ok(()) => self.note_connected(conn.name(), was_used),
            Err(e) => self.metrics.with_server(conn.name(), |m| m.record_error(e.kind())),
        }
        result
    }

    fn note_connected(&self, name: &str, reconnection: bool) {
        self.metrics.with_server(name, |m| {
            if reconnection {
                m.record_reconnection();
            } else {
                m.record_connected();
            }
        });
    }

    /// Make a connection usable for the basic call path
    async fn ensure_ready(&self, conn: &mut Connection) -> McpResult<()> {
        if conn.is_alive() {
            return Ok(());
        }
        if !conn.config().auto_start {
            return Err(McpError::NotConnected(conn.name().to_string()));
        }

        debug!(server = %conn.name(), "Auto-starting MCP connection");
        self.open_basic(conn).await
    }

    // === Calls ===

    /// Run `operation` on `conn`, calling `on_sent` once the request is
    /// written, and record the outcome in the metrics
    pub(crate) async fn execute<F>(
        &self,
        conn: &mut Connection,
        operation: &Operation,
        timeout: Duration,
        on_sent: F,
    ) -> McpResult<Response>
    where
        F: FnOnce(),
    {
        self.ensure_ready(conn).await?;

        let started = Instant::now();
        let sent_before = conn.bytes_sent();
        let received_before = conn.bytes_received();

        let params = operation.params();
        let result = match conn.send_request(operation.method(), params.as_ref()).await {
            Ok(id) => {
                on_sent();
                conn.await_response(id, timeout).await
            }
            Err(e) => Err(e),
        };

        let sent = conn.bytes_sent() - sent_before;
        let received = conn.bytes_received() - received_before;
        self.record_outcome(conn.name(), started.elapsed(), &result, sent, received);

        result
    }

    fn record_outcome(
        &self,
        server: &str,
        latency: Duration,
        result: &McpResult<Response>,
        sent: u64,
        received: u64,
    ) {
        self.metrics.with_server(server, |m| {
            m.record_bytes(sent, received);
            match result {
                Ok(response) => {
                    m.record_call(latency, response.success);
                    if !response.success {
                        m.record_error("application");
                    }
                }
                Err(e) => {
                    m.record_call(latency, false);
                    m.record_error(e.kind());
                    if matches!(e, McpError::Timeout(_)) {
                        m.record_timeout();
                    }
                }
            }
        });
    }

    /// Run `operation` on the shared connection of `server`
    pub async fn invoke(&self, server: &str, operation: &Operation) -> McpResult<Response> {
        let connection = self.connection(server)?;
        let mut conn = connection.lock().await;
        self.execute(&mut conn, operation, self.config.receive_timeout, || {})
            .await
    }

    /// Call a tool. A server-side failure is `Ok` with `success == false`.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> McpResult<Response> {
        self.invoke(server, &Operation::call_tool(tool, arguments))
            .await
    }

    /// List the server's tools
    pub async fn list_tools(&self, server: &str) -> McpResult<Response> {
        self.invoke(server, &Operation::ListTools).await
    }

    /// List the server's resources
    pub async fn list_resources(&self, server: &str) -> McpResult<Response> {
        self.invoke(server, &Operation::ListResources).await
    }

    /// Read one resource
    pub async fn read_resource(&self, server: &str, uri: &str) -> McpResult<Response> {
        self.invoke(
            server,
            &Operation::ReadResource {
                uri: uri.to_string(),
            },
        )
        .await
    }

    /// Call a tool on a fresh, initialized connection, reconnecting once
    /// and retrying if the first attempt fails outright
    ///
    /// # Errors
    /// `Unreachable` when the server cannot be reached after retries;
    /// otherwise the error of the second attempt
    pub async fn call_tool_safe(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<Value>,
    ) -> McpResult<Response> {
        let connection = self.connection(server)?;
        let mut conn = connection.lock().await;
        let operation = Operation::call_tool(tool, arguments);

        match self.safe_attempt(&mut conn, &operation, false).await {
            Ok(response) => Ok(response),
            Err(e @ McpError::Unreachable { .. }) => Err(e),
            Err(e) => {
                warn!(server = %server, tool = %tool, error = %e, "Tool call failed, reconnecting for one retry");
                self.safe_attempt(&mut conn, &operation, true).await
            }
        }
    }

    async fn safe_attempt(
        &self,
        conn: &mut Connection,
        operation: &Operation,
        force_reconnect: bool,
    ) -> McpResult<Response> {
        if force_reconnect || !conn.is_initialized() || protocol::is_stale(conn, &self.config) {
            if conn.state() == ConnectionState::Connected {
                debug!(server = %conn.name(), "Dropping stale MCP connection");
            }
            conn.disconnect();
            self.reconnect(conn).await?;
        }

        self.execute(conn, operation, self.config.receive_timeout, || {})
            .await
    }
}
