// ABOUTME: JSON-RPC envelopes, MCP handshake and connection resilience
//
// - build_request / build_notification: outgoing envelopes
// - parse_response / classify: incoming lines (result text or error message)
// - initialize: protocol version + client identity, then the initialized
//   notification
// - connect_with_retry: connect + initialize with exponential backoff
// - is_stale: not connected, idle too long, or too many errors

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use super::backoff::ExponentialBackoff;
use super::config::{ClientConfig, RetryPolicy};
use super::connection::{Connection, ConnectionState};
use super::error::{McpError, McpResult};

/// MCP revision announced during initialize
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client identity announced during initialize
pub const CLIENT_NAME: &str = "tmux-mcp-client";

/// Client version announced during initialize
pub const CLIENT_VERSION: &str = "1.0.0";

/// JSON-RPC "method not found"
const METHOD_NOT_FOUND: i64 = -32601;

/// Outcome of one request as reported by the server
///
/// `success` with `result` holding the raw JSON text of the result field,
/// or a failure with the server's `error.message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    /// Id echoed by the server, when numeric
    pub request_id: Option<u64>,

    /// True when the envelope carried a result
    pub success: bool,

    /// Compact JSON text of the result
    pub result: Option<String>,

    /// `error.message` from the envelope
    pub error_message: Option<String>,

    /// `error.code` from the envelope
    pub error_code: Option<i64>,
}

impl Response {
    /// Parse the result text back into a JSON value
    #[must_use]
    pub fn result_value(&self) -> Option<Value> {
        self.result
            .as_deref()
            .and_then(|text| serde_json::from_str(text).ok())
    }
}

/// A line received from a server
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Answer to one of our requests
    Response(Response),

    /// Server notification, no reply expected
    Notification {
        /// Notification method
        method: String,
    },

    /// Server-initiated request expecting a reply
    Request {
        /// Request id, echoed back verbatim
        id: Value,
        /// Requested method
        method: String,
    },
}

/// Build a request envelope for `method` under caller-assigned `id`
#[must_use]
pub fn build_request(id: u64, method: &str, params: Option<&Value>) -> String {
    let mut envelope = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if let (Some(params), Some(object)) = (params, envelope.as_object_mut()) {
        object.insert("params".to_string(), params.clone());
    }
    envelope.to_string()
}

/// Build a notification envelope (no id, no response expected)
#[must_use]
pub fn build_notification(method: &str, params: Option<&Value>) -> String {
    let mut envelope = json!({
        "jsonrpc": "2.0",
        "method": method,
    });
    if let (Some(params), Some(object)) = (params, envelope.as_object_mut()) {
        object.insert("params".to_string(), params.clone());
    }
    envelope.to_string()
}

/// Error reply for a server-initiated request we do not handle
#[must_use]
pub fn build_method_not_found(id: &Value, method: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}"),
        },
    })
    .to_string()
}

/// Extract the result text or error message from a response payload
///
/// # Errors
/// `MalformedResponse` when the payload is not JSON or carries neither a
/// `result` nor an `error` field
pub fn parse_response(raw: &str) -> McpResult<Response> {
    let object = parse_object(raw)?;
    response_from_object(&object)
}

/// Sort an incoming line into response, notification or server request
///
/// # Errors
/// `MalformedResponse` for anything that is none of the three
pub fn classify(raw: &str) -> McpResult<Incoming> {
    let object = parse_object(raw)?;

    if let Some(method) = object.get("method").and_then(Value::as_str) {
        return Ok(match object.get("id") {
            Some(id) if !id.is_null() => Incoming::Request {
                id: id.clone(),
                method: method.to_string(),
            },
            _ => Incoming::Notification {
                method: method.to_string(),
            },
        });
    }

    response_from_object(&object).map(Incoming::Response)
}

fn parse_object(raw: &str) -> McpResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(McpError::MalformedResponse(
            "expected a JSON object".to_string(),
        )),
        Err(e) => Err(McpError::MalformedResponse(e.to_string())),
    }
}

fn response_from_object(object: &Map<String, Value>) -> McpResult<Response> {
    let request_id = object.get("id").and_then(Value::as_u64);

    if let Some(result) = object.get("result") {
        return Ok(Response {
            request_id,
            success: true,
            result: Some(result.to_string()),
            error_message: None,
            error_code: None,
        });
    }

    if let Some(error) = object.get("error") {
        let error_message = match error {
            Value::String(message) => message.clone(),
            _ => error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
        };
        return Ok(Response {
            request_id,
            success: false,
            result: None,
            error_message: Some(error_message),
            error_code: error.get("code").and_then(Value::as_i64),
        });
    }

    Err(McpError::MalformedResponse(
        "neither result nor error present".to_string(),
    ))
}

/// Parameters of the initialize request
#[must_use]
pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "roots": {"listChanged": false},
            "sampling": {},
            "experimental": {},
        },
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": CLIENT_VERSION,
        },
    })
}

/// Perform the MCP handshake on a connected channel
///
/// # Errors
/// Transport errors from the exchange, or `Protocol` if the server rejects
/// initialize
pub async fn initialize(conn: &mut Connection, timeout: Duration) -> McpResult<()> {
    let response = conn
        .request("initialize", Some(&initialize_params()), timeout)
        .await?;

    if !response.success {
        let reason = response
            .error_message
            .unwrap_or_else(|| "initialize rejected".to_string());
        return Err(McpError::Protocol(reason));
    }

    conn.notify("notifications/initialized", None).await?;
    conn.mark_initialized();

    info!(server = %conn.name(), "MCP session initialized");
    Ok(())
}

/// Connect and initialize, retrying with exponential backoff
///
/// Sleeps between attempts only, never after the last one. On exhaustion
/// the connection is left in the `Error` state.
///
/// # Errors
/// `Unreachable` once every attempt has failed
pub async fn connect_with_retry(
    conn: &mut Connection,
    policy: &RetryPolicy,
    timeout: Duration,
) -> McpResult<()> {
    retry_connect(conn, policy, Some(timeout)).await
}

/// Open the channel only, retrying with exponential backoff. The caller
/// decides what to do about the handshake.
///
/// # Errors
/// `Unreachable` once every attempt has failed
pub async fn open_with_retry(conn: &mut Connection, policy: &RetryPolicy) -> McpResult<()> {
    retry_connect(conn, policy, None).await
}

async fn retry_connect(
    conn: &mut Connection,
    policy: &RetryPolicy,
    handshake: Option<Duration>,
) -> McpResult<()> {
    let attempts = policy.max_attempts.max(1);
    let mut backoff = ExponentialBackoff::from_policy(policy);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match establish(conn, handshake).await {
            Ok(()) => {
                if attempt > 1 {
                    info!(server = %conn.name(), attempt, "Connected after retry");
                }
                return Ok(());
            }
            Err(e) => {
                warn!(
                    server = %conn.name(),
                    attempt,
                    max = attempts,
                    error = %e,
                    "MCP connection attempt failed"
                );
                conn.disconnect();
                last_error = Some(e);

                if attempt < attempts {
                    let delay = backoff.next_delay();
                    debug!(server = %conn.name(), delay_ms = delay.as_millis(), "Backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    conn.mark_error();
    Err(McpError::Unreachable {
        server: conn.name().to_string(),
        attempts,
        reason: last_error.map_or_else(|| "unknown".to_string(), |e| e.to_string()),
    })
}

async fn establish(conn: &mut Connection, handshake: Option<Duration>) -> McpResult<()> {
    if conn.state() != ConnectionState::Connected {
        conn.connect().await?;
    }
    if let Some(timeout) = handshake {
        if !conn.is_initialized() {
            initialize(conn, timeout).await?;
        }
    }
    Ok(())
}

/// True if the connection should be re-established before use
#[must_use]
pub fn is_stale(conn: &Connection, config: &ClientConfig) -> bool {
    if conn.state() != ConnectionState::Connected || conn.is_interrupted() {
        return true;
    }

    if conn.idle_time() > config.stale_idle_timeout {
        return true;
    }

    conn.error_rate() > config.stale_error_rate
}
