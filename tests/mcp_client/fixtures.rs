// ABOUTME: Shared fixtures for MCP client integration tests
//
// Provides:
// - McpTestServer: fake MCP server on a Unix socket in a temp dir
// - stdio server commands built from sh/sed for the process transport
// - fast_config(): client tunables with short timeouts and backoff

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use tmux_agentic::mcp_client::config::RetryPolicy;
use tmux_agentic::mcp_client::{ClientConfig, ServerConfig};

/// Client tunables suited to tests
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        receive_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
        ..ClientConfig::default()
    }
}

#[derive(Default)]
struct Observed {
    recorded: Mutex<Vec<Value>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    requests: AtomicUsize,
}

/// Fake MCP server; stops when dropped
///
/// Tools: echo, fail, slow (`{"ms": n}`), hang, record (stores arguments).
/// Resources: a single `mem://readme`.
pub struct McpTestServer {
    _dir: TempDir,
    path: PathBuf,
    observed: Arc<Observed>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
    accept: JoinHandle<()>,
}

impl Drop for McpTestServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl McpTestServer {
    pub async fn start() -> Self {
        Self::serve_in(TempDir::new().unwrap())
    }

    /// Stop serving, close every open connection and listen again on the
    /// same socket path
    pub fn restart(mut self) -> Self {
        self.shutdown();
        let dir = std::mem::replace(&mut self._dir, TempDir::new().unwrap());
        std::fs::remove_file(&self.path).unwrap();
        Self::serve_in(dir)
    }

    fn serve_in(dir: TempDir) -> Self {
        let path = dir.path().join("mcp.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let observed = Arc::new(Observed::default());
        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();

        let accept = {
            let observed = Arc::clone(&observed);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let (read, write) = stream.into_split();
                    let write = Arc::new(AsyncMutex::new(write));
                    let observed = Arc::clone(&observed);
                    let handle = tokio::spawn(async move {
                        let mut lines = BufReader::new(read).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                                continue;
                            };
                            if request.get("id").is_none() {
                                continue;
                            }
                            observed.requests.fetch_add(1, Ordering::SeqCst);
                            let write = Arc::clone(&write);
                            let observed = Arc::clone(&observed);
                            tokio::spawn(async move { answer(request, &observed, &write).await });
                        }
                    });
                    connections.lock().unwrap().push(handle);
                }
            })
        };

        Self {
            _dir: dir,
            path,
            observed,
            connections,
            accept,
        }
    }

    fn shutdown(&self) {
        self.accept.abort();
        for handle in self.connections.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    /// Socket config for this server
    pub fn config(&self, name: &str, auto_start: bool) -> ServerConfig {
        ServerConfig::socket(name, &self.path).with_auto_start(auto_start)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Arguments received by the record tool, in arrival order
    pub fn recorded(&self) -> Vec<Value> {
        self.observed.recorded.lock().unwrap().clone()
    }

    /// Most tool calls ever in progress at once
    pub fn peak_in_flight(&self) -> usize {
        self.observed.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Requests (with ids) received across all connections
    pub fn request_count(&self) -> usize {
        self.observed.requests.load(Ordering::SeqCst)
    }
}

async fn answer(request: Value, observed: &Observed, write: &AsyncMutex<OwnedWriteHalf>) {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or_default();
    let params = &request["params"];

    let outcome: Result<Value, (i64, String)> = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}, "resources": {}},
            "serverInfo": {"name": "test-server", "version": "1.0.0"}
        })),
        "tools/list" => Ok(json!({"tools": [
            {"name": "echo"}, {"name": "fail"}, {"name": "slow"}, {"name": "hang"}, {"name": "record"}
        ]})),
        "resources/list" => Ok(json!({"resources": [{"uri": "mem://readme", "name": "readme"}]})),
        "resources/read" if params["uri"] == "mem://readme" => {
            Ok(json!({"contents": [{"uri": "mem://readme", "text": "read me"}]}))
        }
        "resources/read" => Err((-32002, "Resource not found".to_string())),
        "tools/call" => {
            let now = observed.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            observed.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            let outcome = call_tool(params, observed).await;
            observed.in_flight.fetch_sub(1, Ordering::SeqCst);
            match outcome {
                Some(outcome) => outcome,
                None => return,
            }
        }
        other => Err((-32601, format!("Method not found: {other}"))),
    };

    let reply = match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    };
    let mut frame = reply.to_string();
    frame.push('\n');
    let _ = write.lock().await.write_all(frame.as_bytes()).await;
}

/// None means the call never gets an answer
async fn call_tool(params: &Value, observed: &Observed) -> Option<Result<Value, (i64, String)>> {
    let arguments = params["arguments"].clone();
    let outcome = match params["name"].as_str().unwrap_or_default() {
        "echo" => Ok(json!({"content": [{"type": "text", "text": arguments.to_string()}]})),
        "fail" => Err((-32000, "tool failed".to_string())),
        "slow" => {
            let ms = arguments["ms"].as_u64().unwrap_or(50);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({"slept": ms}))
        }
        "hang" => {
            std::future::pending::<()>().await;
            return None;
        }
        "record" => {
            observed.recorded.lock().unwrap().push(arguments);
            Ok(json!({}))
        }
        other => Err((-32602, format!("Unknown tool: {other}"))),
    };
    Some(outcome)
}

/// sed program answering every request line with `{"ok":true}` under the
/// request's id; lines without an id pass through untouched
pub const SED_RESPONDER: &str =
    r#"s/^.*"id":\([0-9][0-9]*\).*$/{"jsonrpc":"2.0","id":\1,"result":{"ok":true}}/"#;

/// A stdio server built on `sed -u`
pub fn sed_server(name: &str) -> ServerConfig {
    ServerConfig::stdio(name, "sed", ["-u", SED_RESPONDER])
}

/// A stdio server that answers with the value of $GREETING
pub fn greeting_server(name: &str, greeting: &str) -> ServerConfig {
    let script = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"greeting":"%s"}}\n' "$id" "$GREETING"
  fi
done"#;
    let mut config = ServerConfig::stdio(name, "sh", ["-c", script]);
    if let tmux_agentic::mcp_client::TransportKind::Stdio { env, .. } = &mut config.transport {
        env.insert("GREETING".to_string(), greeting.to_string());
    }
    config
}
