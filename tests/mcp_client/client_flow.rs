// ABOUTME: End-to-end tests of McpClient over a Unix socket server

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use super::fixtures::{fast_config, McpTestServer};
use tmux_agentic::mcp_client::{ConnectionState, McpClient, McpError, ServerConfig};

#[tokio::test]
async fn test_call_tool_round_trip() {
    let server = McpTestServer::start().await;
    let client = McpClient::new(fast_config());
    client.add_server(server.config("notes", true)).unwrap();

    let response = client
        .call_tool("notes", "echo", Some(json!({"msg": "hi"})))
        .await
        .unwrap();

    assert!(response.success);
    let text = response.result_value().unwrap()["content"][0]["text"].clone();
    assert_eq!(text, json!(r#"{"msg":"hi"}"#));
}

#[tokio::test]
async fn test_application_error_is_not_a_transport_error() {
    let server = McpTestServer::start().await;
    let client = McpClient::new(fast_config());
    client.add_server(server.config("notes", true)).unwrap();

    let response = client.call_tool("notes", "fail", None).await.unwrap();
    assert!(!response.success);
    assert_eq!(response.error_message.as_deref(), Some("tool failed"));
    assert_eq!(response.error_code, Some(-32000));

    // The connection survives application errors
    let stats = client.connection_stats("notes").await.unwrap();
    assert_eq!(stats.state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_resources() {
    let server = McpTestServer::start().await;
    let client = McpClient::new(fast_config());
    client.add_server(server.config("notes", true)).unwrap();

    let listed = client.list_resources("notes").await.unwrap();
    assert_eq!(
        listed.result_value().unwrap()["resources"][0]["uri"],
        json!("mem://readme")
    );

    let read = client.read_resource("notes", "mem://readme").await.unwrap();
    assert_eq!(
        read.result_value().unwrap()["contents"][0]["text"],
        json!("read me")
    );

    let missing = client.read_resource("notes", "mem://nope").await.unwrap();
    assert!(!missing.success);
    assert_eq!(missing.error_message.as_deref(), Some("Resource not found"));
}

#[tokio::test]
async fn test_manual_connect_required_without_auto_start() {
    let server = McpTestServer::start().await;
    let client = McpClient::new(fast_config());
    client.add_server(server.config("notes", false)).unwrap();

    assert!(matches!(
        client.list_tools("notes").await,
        Err(McpError::NotConnected(_))
    ));

    client.connect_with_retry("notes").await.unwrap();
    let tools = client.list_tools("notes").await.unwrap();
    assert_eq!(tools.result_value().unwrap()["tools"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_unreachable_server_after_retries() {
    let dir = tempfile::tempdir().unwrap();
    let client = McpClient::new(fast_config());
    client
        .add_server(ServerConfig::socket("gone", dir.path().join("gone.sock")))
        .unwrap();

    let err = client.call_tool_safe("gone", "echo", None).await.unwrap_err();
    match err {
        McpError::Unreachable { server, attempts, .. } => {
            assert_eq!(server, "gone");
            assert_eq!(attempts, 2);
        }
        other => panic!("expected Unreachable, got {other:?}"),
    }

    let snapshot = client.metrics_snapshot("gone").unwrap();
    assert_eq!(snapshot.top_error_type.as_deref(), Some("unreachable"));
}

#[tokio::test]
async fn test_safe_call_recovers_after_server_restart() {
    let server = McpTestServer::start().await;
    let client = McpClient::new(fast_config());
    client.add_server(server.config("notes", true)).unwrap();

    client.call_tool("notes", "echo", None).await.unwrap();

    // The peer goes away under an established connection
    let server = server.restart();

    let response = client.call_tool_safe("notes", "echo", None).await.unwrap();
    assert!(response.success);
    assert_eq!(server.request_count(), 2);

    let stats = client.connection_stats("notes").await.unwrap();
    assert_eq!(stats.state, ConnectionState::Connected);
}

#[tokio::test]
async fn test_metrics_track_calls() {
    let server = McpTestServer::start().await;
    let client = McpClient::new(fast_config());
    client.add_server(server.config("notes", true)).unwrap();

    for _ in 0..3 {
        client.call_tool("notes", "echo", None).await.unwrap();
    }
    client.call_tool("notes", "fail", None).await.unwrap();

    let snapshot = client.metrics_snapshot("notes").unwrap();
    assert_eq!(snapshot.total_calls, 4);
    assert_eq!(snapshot.successful_calls, 3);
    assert_eq!(snapshot.failed_calls, 1);
    assert_eq!(snapshot.latency.samples, 4);
    assert!(snapshot.latency.p50_us <= snapshot.latency.p95_us);
    assert!(snapshot.latency.p95_us <= snapshot.latency.p99_us);
    assert_eq!(snapshot.top_error_type.as_deref(), Some("application"));
    assert_eq!(snapshot.connections, 1);
}

#[tokio::test]
async fn test_clients_are_independent() {
    let server = McpTestServer::start().await;
    let first = Arc::new(McpClient::new(fast_config()));
    let second = Arc::new(McpClient::new(fast_config()));
    first.add_server(server.config("notes", true)).unwrap();

    assert!(first.has_server("notes"));
    assert!(!second.has_server("notes"));
    assert!(matches!(
        second.call_tool("notes", "echo", None).await,
        Err(McpError::ServerNotFound(_))
    ));
}
