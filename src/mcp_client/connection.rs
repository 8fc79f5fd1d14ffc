// ABOUTME: One logical channel to one named MCP server
//
// Owns the transport, the lifecycle state machine, a strictly increasing
// request-id counter and the sent/received/error counters. Responses are
// matched to requests by id; replies for other ids are held until awaited.
//
//   Disconnected --connect--> Connecting --ok--> Connected
//        ^                        |                 |
//        |                        v                 v
//        +------disconnect---- Error <---transport failure

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::config::ServerConfig;
use super::error::{McpError, McpResult};
use super::protocol::{self, Incoming, Response};
use super::transport::Transport;

/// Replies held for ids nobody is awaiting yet
const MAX_UNMATCHED: usize = 64;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No channel open
    Disconnected,
    /// Channel being opened
    Connecting,
    /// Channel open
    Connected,
    /// Last transport operation failed; only connect recovers
    Error,
}

impl ConnectionState {
    /// Lowercase name used in reports
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a connection's counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStats {
    /// Server name
    pub server: String,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Time since the channel opened
    pub uptime: Duration,
    /// Time since the last successful send or receive
    pub idle: Duration,
    /// Requests written
    pub requests_sent: u64,
    /// Responses read
    pub responses_received: u64,
    /// Transport and timeout failures
    pub errors: u64,
    /// (requests - errors) / requests, as a percentage
    pub success_rate: f64,
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "State: {}, Uptime: {}s, Idle: {}s, Requests: {}, Responses: {}, Errors: {}, Success: {:.1}%",
            self.state,
            self.uptime.as_secs(),
            self.idle.as_secs(),
            self.requests_sent,
            self.responses_received,
            self.errors,
            self.success_rate
        )
    }
}

/// A channel to one server plus its bookkeeping
#[derive(Debug)]
pub struct Connection {
    config: Arc<ServerConfig>,
    state: ConnectionState,
    transport: Option<Transport>,
    next_request_id: u64,

    requests_sent: u64,
    responses_received: u64,
    errors: u64,
    bytes_sent: u64,
    bytes_received: u64,

    connected_at: Option<Instant>,
    last_activity: Instant,

    initialized: bool,
    /// An exchange was abandoned mid-write; the stream may hold a partial frame
    interrupted: bool,
    unmatched: BTreeMap<u64, Response>,
}

impl Connection {
    /// New, disconnected channel for `config`
    #[must_use]
    pub fn new(config: Arc<ServerConfig>) -> Self {
        let now = Instant::now();
        Self {
            config,
            state: ConnectionState::Disconnected,
            transport: None,
            next_request_id: 1,
            requests_sent: 0,
            responses_received: 0,
            errors: 0,
            bytes_sent: 0,
            bytes_received: 0,
            connected_at: None,
            last_activity: now,
            initialized: false,
            interrupted: false,
            unmatched: BTreeMap::new(),
        }
    }

    /// Server name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Shared server record
    #[must_use]
    pub const fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Lifecycle state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// True once the handshake completed on the current channel
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// True if a previous exchange was cut off mid-write
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    /// Requests written
    #[must_use]
    pub const fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    /// Responses read
    #[must_use]
    pub const fn responses_received(&self) -> u64 {
        self.responses_received
    }

    /// Transport and timeout failures over the connection's lifetime
    #[must_use]
    pub const fn errors(&self) -> u64 {
        self.errors
    }

    /// Total bytes written, framing included
    #[must_use]
    pub const fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Total bytes of complete lines read
    #[must_use]
    pub const fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Time since the last successful send or receive
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Child pid for spawned servers
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.transport.as_ref().and_then(Transport::pid)
    }

    /// Lifetime errors per request sent; zero before the first request
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests_sent as f64
        }
    }

    /// Open the channel. No-op when already connected and clean.
    ///
    /// # Errors
    /// `Connect` or `Spawn`; the state becomes `Error`
    pub async fn connect(&mut self) -> McpResult<()> {
        if self.interrupted {
            debug!(server = %self.name(), "Dropping interrupted channel before reconnect");
            self.disconnect();
        }
        if self.state == ConnectionState::Connected && self.transport.is_some() {
            return Ok(());
        }
        if let Some(stale) = self.transport.take() {
            stale.close();
        }

        self.state = ConnectionState::Connecting;
        self.initialized = false;

        match Transport::open(&self.config.transport).await {
            Ok(transport) => {
                info!(
                    server = %self.name(),
                    transport = transport.kind(),
                    "MCP connection established"
                );
                let now = Instant::now();
                self.transport = Some(transport);
                self.state = ConnectionState::Connected;
                self.connected_at = Some(now);
                self.last_activity = now;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Error;
                self.errors += 1;
                Err(e)
            }
        }
    }

    /// Write one message
    ///
    /// # Errors
    /// `NotConnected` without an open channel; I/O failures move the
    /// connection to `Error`
    pub async fn send(&mut self, message: &str) -> McpResult<usize> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(McpError::NotConnected(self.config.name.clone()));
        };

        match transport.send(message).await {
            Ok(written) => {
                self.last_activity = Instant::now();
                self.bytes_sent += written as u64;
                Ok(written)
            }
            Err(e) => {
                self.fail_transport(&e);
                Err(e)
            }
        }
    }

    /// Read the next complete line
    ///
    /// # Errors
    /// `Timeout` (counted, channel kept), `Eof` and I/O failures (channel
    /// dropped, state `Error`)
    pub async fn receive(&mut self, timeout: Duration) -> McpResult<String> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(McpError::NotConnected(self.config.name.clone()));
        };

        match transport.receive(timeout).await {
            Ok(line) => {
                self.last_activity = Instant::now();
                self.bytes_received += line.len() as u64 + 1;
                Ok(line)
            }
            Err(McpError::Timeout(bound)) => {
                self.errors += 1;
                Err(McpError::Timeout(bound))
            }
            Err(e) => {
                self.fail_transport(&e);
                Err(e)
            }
        }
    }

    fn fail_transport(&mut self, error: &McpError) {
        warn!(server = %self.name(), error = %error, "MCP transport failure");
        self.errors += 1;
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
        self.state = ConnectionState::Error;
        self.initialized = false;
    }

    /// Hand out the next request id
    pub fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Write a request under a fresh id and return the id
    pub async fn send_request(&mut self, method: &str, params: Option<&Value>) -> McpResult<u64> {
        if self.interrupted {
            return Err(McpError::NotConnected(self.config.name.clone()));
        }

        let id = self.next_request_id();
        let message = protocol::build_request(id, method, params);
        self.send_frame(&message).await?;

        self.requests_sent += 1;
        debug!(server = %self.name(), id, method, "Request sent");
        Ok(id)
    }

    /// Write one frame, leaving `interrupted` set if the future is dropped
    /// before the write completes
    async fn send_frame(&mut self, message: &str) -> McpResult<usize> {
        self.interrupted = true;
        let result = self.send(message).await;
        self.interrupted = false;
        result
    }

    /// Wait for the response carrying `id`, holding replies for other ids
    ///
    /// # Errors
    /// `Timeout` if the matching reply does not arrive within `timeout`,
    /// plus any transport or parse failure
    pub async fn await_response(&mut self, id: u64, timeout: Duration) -> McpResult<Response> {
        if let Some(response) = self.unmatched.remove(&id) {
            return Ok(response);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.errors += 1;
                return Err(McpError::Timeout(timeout));
            }

            let line = match self.receive(remaining).await {
                Ok(line) => line,
                Err(McpError::Timeout(_)) => return Err(McpError::Timeout(timeout)),
                Err(e) => return Err(e),
            };

            match protocol::classify(&line) {
                Ok(Incoming::Response(response)) => {
                    self.responses_received += 1;
                    match response.request_id {
                        Some(rid) if rid == id => return Ok(response),
                        Some(rid) => self.hold_unmatched(rid, response),
                        None => debug!(server = %self.name(), "Dropping response without id"),
                    }
                }
                Ok(Incoming::Notification { method }) => {
                    debug!(server = %self.name(), method = %method, "Server notification");
                }
                Ok(Incoming::Request { id: server_id, method }) => {
                    debug!(server = %self.name(), method = %method, "Declining server request");
                    let reply = protocol::build_method_not_found(&server_id, &method);
                    self.send_frame(&reply).await?;
                }
                Err(e) => {
                    self.errors += 1;
                    return Err(e);
                }
            }
        }
    }

    fn hold_unmatched(&mut self, id: u64, response: Response) {
        debug!(server = %self.name(), id, "Holding out-of-order response");
        self.unmatched.insert(id, response);
        while self.unmatched.len() > MAX_UNMATCHED {
            self.unmatched.pop_first();
        }
    }

    /// Send a request and wait for its matching response
    pub async fn request(
        &mut self,
        method: &str,
        params: Option<&Value>,
        timeout: Duration,
    ) -> McpResult<Response> {
        let id = self.send_request(method, params).await?;
        self.await_response(id, timeout).await
    }

    /// Send a notification (no id, no response)
    pub async fn notify(&mut self, method: &str, params: Option<&Value>) -> McpResult<()> {
        let message = protocol::build_notification(method, params);
        self.send_frame(&message).await.map(|_| ())
    }

    /// Close the channel and reset to `Disconnected`. Safe to repeat.
    pub fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            info!(server = %self.name(), "MCP connection closed");
            transport.close();
        }
        self.state = ConnectionState::Disconnected;
        self.initialized = false;
        self.interrupted = false;
        self.connected_at = None;
        self.unmatched.clear();
    }

    /// Channel open and, for spawned servers, the child still running
    pub fn is_alive(&mut self) -> bool {
        self.state == ConnectionState::Connected
            && !self.interrupted
            && self.transport.as_mut().is_some_and(Transport::is_alive)
    }

    /// Alive and active within `max_idle`
    pub fn is_healthy(&mut self, max_idle: Duration) -> bool {
        self.is_alive() && self.idle_time() <= max_idle
    }

    pub(crate) fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub(crate) fn mark_error(&mut self) {
        self.state = ConnectionState::Error;
    }

    /// Counters and timings for reporting
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> ConnectionStats {
        let success_rate = if self.requests_sent == 0 {
            0.0
        } else {
            self.requests_sent.saturating_sub(self.errors) as f64 / self.requests_sent as f64
                * 100.0
        };

        ConnectionStats {
            server: self.config.name.clone(),
            state: self.state,
            uptime: self.connected_at.map_or(Duration::ZERO, |at| at.elapsed()),
            idle: self.idle_time(),
            requests_sent: self.requests_sent,
            responses_received: self.responses_received,
            errors: self.errors,
            success_rate,
        }
    }
}
