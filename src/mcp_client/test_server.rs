// ABOUTME: In-process fake MCP server on a Unix socket for unit tests
//
// Answers initialize, tools/list, resources/list, resources/read and
// tools/call. Tool behavior is chosen by name:
// - echo:  result {"echoed": arguments}
// - fail:  error {"code": -32000, "message": "boom"}
// - slow:  sleeps arguments.ms, then result {"slept": ms}
// - hang:  never answers
// - noisy: sends a notification before the result
// Each request is handled on its own task, so replies may be reordered.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::task::JoinHandle;

use super::config::ServerConfig;

/// Knobs for the fake server
#[derive(Debug, Clone, Default)]
pub struct ServerBehavior {
    /// Answer initialize with an error
    pub reject_initialize: bool,
    /// Drop the connection instead of answering the first N tool calls
    pub drop_first_calls: usize,
}

/// Running fake server; stops when dropped
pub struct FakeServer {
    _dir: TempDir,
    path: PathBuf,
    methods: Arc<Mutex<Vec<String>>>,
    tools: Arc<Mutex<Vec<String>>>,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl FakeServer {
    pub async fn start() -> Self {
        Self::start_with(ServerBehavior::default()).await
    }

    pub async fn start_with(behavior: ServerBehavior) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake-mcp.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let methods = Arc::new(Mutex::new(Vec::new()));
        let tools = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let dropped_calls = Arc::new(AtomicUsize::new(0));

        let handle = {
            let methods = Arc::clone(&methods);
            let tools = Arc::clone(&tools);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (read, write) = stream.into_split();
                    let write = Arc::new(tokio::sync::Mutex::new(write));
                    let methods = Arc::clone(&methods);
                    let tools = Arc::clone(&tools);
                    let behavior = behavior.clone();
                    let dropped_calls = Arc::clone(&dropped_calls);

                    tokio::spawn(async move {
                        let mut lines = BufReader::new(read).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                                continue;
                            };
                            let method = request["method"].as_str().unwrap_or("").to_string();
                            methods.lock().unwrap().push(method.clone());
                            if method == "tools/call" {
                                let tool = request["params"]["name"].as_str().unwrap_or("");
                                tools.lock().unwrap().push(tool.to_string());
                            }
                            if request.get("id").is_none() {
                                continue;
                            }

                            if method == "tools/call"
                                && dropped_calls.fetch_add(1, Ordering::SeqCst)
                                    < behavior.drop_first_calls
                            {
                                break;
                            }

                            let write = Arc::clone(&write);
                            let reject = behavior.reject_initialize;
                            tokio::spawn(async move {
                                respond(request, &method, reject, &write).await;
                            });
                        }
                    });
                }
            })
        };

        Self {
            _dir: dir,
            path,
            methods,
            tools,
            connections,
            handle,
        }
    }

    /// Socket config with auto-start enabled
    pub fn config(&self, name: &str) -> ServerConfig {
        ServerConfig::socket(name, &self.path).with_auto_start(true)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every method received, in arrival order
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    /// Tool names of tools/call requests, in arrival order
    pub fn tool_calls(&self) -> Vec<String> {
        self.tools.lock().unwrap().clone()
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn respond(
    request: Value,
    method: &str,
    reject_initialize: bool,
    write: &tokio::sync::Mutex<OwnedWriteHalf>,
) {
    let id = request["id"].clone();
    let params = &request["params"];

    let reply = match method {
        "initialize" if reject_initialize => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32600, "message": "unsupported version"}})
        }
        "initialize" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake", "version": "0.0.1"}
            }
        }),
        "tools/list" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"tools": [{"name": "echo"}, {"name": "fail"}, {"name": "slow"}]}
        }),
        "resources/list" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"resources": [{"uri": "mem://notes", "name": "notes"}]}
        }),
        "resources/read" => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"contents": [{"uri": params["uri"], "text": "hello"}]}
        }),
        "tools/call" => {
            let arguments = params["arguments"].clone();
            match params["name"].as_str().unwrap_or("") {
                "echo" => json!({"jsonrpc": "2.0", "id": id, "result": {"echoed": arguments}}),
                "fail" => {
                    json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32000, "message": "boom"}})
                }
                "slow" => {
                    let ms = arguments["ms"].as_u64().unwrap_or(50);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    json!({"jsonrpc": "2.0", "id": id, "result": {"slept": ms}})
                }
                "hang" => return,
                "noisy" => {
                    let note = json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}});
                    write_line(write, &note).await;
                    json!({"jsonrpc": "2.0", "id": id, "result": {}})
                }
                other => json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32602, "message": format!("Unknown tool: {other}")}
                }),
            }
        }
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": format!("Method not found: {other}")}
        }),
    };

    write_line(write, &reply).await;
}

async fn write_line(write: &tokio::sync::Mutex<OwnedWriteHalf>, value: &Value) {
    let mut frame = value.to_string();
    frame.push('\n');
    let _ = write.lock().await.write_all(frame.as_bytes()).await;
}
