// ABOUTME: Process transport tests against small sh/sed servers

use pretty_assertions::assert_eq;
use serde_json::json;

use super::fixtures::{fast_config, greeting_server, sed_server};
use tmux_agentic::mcp_client::config::load_servers_from_file;
use tmux_agentic::mcp_client::{ConnectionState, McpClient, McpError, ServerConfig};

#[tokio::test]
async fn test_sed_server_answers_by_id() {
    let client = McpClient::new(fast_config());
    client.add_server(sed_server("sed")).unwrap();

    for _ in 0..3 {
        let response = client.call_tool("sed", "anything", None).await.unwrap();
        assert!(response.success);
        assert_eq!(response.result_value(), Some(json!({"ok": true})));
    }

    let connection = client.connection("sed").unwrap();
    let conn = connection.lock().await;
    assert!(conn.pid().is_some());
    assert!(conn.is_initialized());
    // initialize plus three tool calls
    assert_eq!(conn.requests_sent(), 4);
    assert_eq!(conn.responses_received(), 4);
}

#[tokio::test]
async fn test_child_environment_is_passed() {
    let client = McpClient::new(fast_config());
    client.add_server(greeting_server("greeter", "hello from env")).unwrap();

    let response = client.call_tool("greeter", "greet", None).await.unwrap();
    assert_eq!(
        response.result_value(),
        Some(json!({"greeting": "hello from env"}))
    );
}

#[tokio::test]
async fn test_disconnect_stops_child() {
    let client = McpClient::new(fast_config());
    client.add_server(sed_server("sed")).unwrap();
    client.connect_server("sed").await.unwrap();

    let connection = client.connection("sed").unwrap();
    let pid = connection.lock().await.pid().unwrap();

    client.disconnect_server("sed").await.unwrap();
    client.disconnect_server("sed").await.unwrap();
    assert_eq!(
        connection.lock().await.state(),
        ConnectionState::Disconnected
    );

    // SIGTERM delivered on disconnect; give the child a moment to exit
    let proc_path = format!("/proc/{pid}");
    for _ in 0..50 {
        let gone = std::fs::read_to_string(format!("{proc_path}/stat"))
            .map_or(true, |stat| stat.contains(") Z "));
        if gone {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("child {pid} still running after disconnect");
}

#[tokio::test]
async fn test_exiting_server_is_unreachable() {
    let client = McpClient::new(fast_config());
    client
        .add_server(ServerConfig::stdio("quitter", "true", Vec::<String>::new()))
        .unwrap();

    let err = client.call_tool_safe("quitter", "echo", None).await.unwrap_err();
    assert!(matches!(err, McpError::Unreachable { attempts: 2, .. }));
}

#[tokio::test]
async fn test_missing_executable() {
    let client = McpClient::new(fast_config());
    client
        .add_server(ServerConfig::stdio(
            "ghost",
            "/nonexistent/mcp-server",
            Vec::<String>::new(),
        ))
        .unwrap();

    let err = client.call_tool("ghost", "echo", None).await.unwrap_err();
    match err {
        McpError::Unreachable { attempts, reason, .. } => {
            assert_eq!(attempts, 2);
            assert!(reason.contains("Failed to spawn"), "{reason}");
        }
        other => panic!("expected Unreachable, got {other:?}"),
    }
    let snapshot = client.metrics_snapshot("ghost").unwrap();
    assert_eq!(snapshot.top_error_type.as_deref(), Some("unreachable"));
}

#[tokio::test]
async fn test_servers_loaded_from_claude_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".claude.json");
    let document = json!({
        "mcpServers": {
            "responder": {"command": "sed", "args": ["-u", super::fixtures::SED_RESPONDER]},
            "remote": {"socket": "/tmp/never-bound.sock"},
            "broken": {"url": "https://example.invalid"}
        }
    });
    std::fs::write(&path, document.to_string()).unwrap();

    let servers = load_servers_from_file(&path).unwrap();
    let client = McpClient::from_servers(fast_config(), servers);
    assert_eq!(client.server_names(), vec!["remote", "responder"]);

    let response = client.call_tool("responder", "ping", None).await.unwrap();
    assert!(response.success);

    assert!(matches!(
        client.call_tool("remote", "ping", None).await,
        Err(McpError::NotConnected(_))
    ));
}
