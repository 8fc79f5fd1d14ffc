// ABOUTME: Dispatcher and pool working together against the socket server

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use super::fixtures::{fast_config, McpTestServer};
use tmux_agentic::mcp_client::config::{DispatcherConfig, PoolSettings};
use tmux_agentic::mcp_client::{
    AsyncDispatcher, ConnectionPool, McpClient, Operation, Priority, RequestOutcome, RequestState,
};

fn dispatcher_config(max_concurrent_per_server: usize) -> DispatcherConfig {
    DispatcherConfig {
        max_concurrent_per_server,
        poll_interval: Duration::from_millis(10),
        requeue_delay: Duration::from_millis(10),
        ..DispatcherConfig::default()
    }
}

#[tokio::test]
async fn test_pooled_dispatch_bounds_server_concurrency() {
    let server = McpTestServer::start().await;
    let client = Arc::new(McpClient::new(fast_config()));
    client.add_server(server.config("notes", true)).unwrap();

    let pool = Arc::new(ConnectionPool::new(
        Arc::clone(&client),
        PoolSettings {
            max_size: 2,
            idle_timeout: Duration::from_secs(60),
        },
    ));
    let dispatcher = AsyncDispatcher::new(Arc::clone(&client), dispatcher_config(2))
        .with_pool(Arc::clone(&pool));

    let outcomes: Arc<Mutex<Vec<RequestOutcome>>> = Arc::default();
    let sink = Arc::clone(&outcomes);
    let requests = (0..6)
        .map(|_| {
            (
                "notes".to_string(),
                Operation::call_tool("slow", Some(json!({"ms": 40}))),
                Priority::Normal,
            )
        })
        .collect();
    let ids = dispatcher.call_parallel(requests, move |o| sink.lock().unwrap().push(o.clone()));
    dispatcher.wait_all(&ids).await;

    let outcomes = outcomes.lock().unwrap().clone();
    assert_eq!(outcomes.len(), 6);
    assert!(outcomes.iter().all(|o| o.state == RequestState::Completed));
    assert!(server.peak_in_flight() <= 2);

    let stats = pool.stats("notes").unwrap();
    assert_eq!(stats.creates, 2);
    assert_eq!(stats.total, 2);
    assert_eq!(stats.idle, 2);

    let dispatched = dispatcher.stats();
    assert_eq!(dispatched.total_queued, 6);
    assert_eq!(dispatched.total_completed, 6);
    assert_eq!(dispatched.active, 0);
}

#[tokio::test]
async fn test_priorities_reach_server_in_order() {
    let server = McpTestServer::start().await;
    let client = Arc::new(McpClient::new(fast_config()));
    client.add_server(server.config("notes", true)).unwrap();
    let dispatcher = AsyncDispatcher::new(client, dispatcher_config(1));

    let requests = [
        (Priority::Low, "low"),
        (Priority::Normal, "normal"),
        (Priority::Urgent, "urgent"),
        (Priority::High, "high"),
    ]
    .into_iter()
    .map(|(priority, tag)| {
        (
            "notes".to_string(),
            Operation::call_tool("record", Some(json!({"tag": tag}))),
            priority,
        )
    })
    .collect();
    let ids = dispatcher.call_parallel(requests, |_| {});
    dispatcher.wait_all(&ids).await;

    let tags: Vec<String> = server
        .recorded()
        .iter()
        .map(|args| args["tag"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(tags, vec!["urgent", "high", "normal", "low"]);
}

#[tokio::test]
async fn test_timed_out_request_does_not_block_others() {
    let server = McpTestServer::start().await;
    let client = Arc::new(McpClient::new(fast_config()));
    client.add_server(server.config("notes", true)).unwrap();
    let pool = Arc::new(ConnectionPool::from_client(Arc::clone(&client)));
    let dispatcher = AsyncDispatcher::new(client, dispatcher_config(5)).with_pool(pool);

    let outcomes: Arc<Mutex<Vec<RequestOutcome>>> = Arc::default();
    let hung = {
        let sink = Arc::clone(&outcomes);
        dispatcher.submit(
            "notes",
            Operation::call_tool("hang", None),
            Priority::Normal,
            Some(Duration::from_millis(100)),
            Box::new(move |o| sink.lock().unwrap().push(o.clone())),
        )
    };
    let quick = {
        let sink = Arc::clone(&outcomes);
        dispatcher.call_tool_async(
            "notes",
            "echo",
            None,
            Priority::Normal,
            Box::new(move |o| sink.lock().unwrap().push(o.clone())),
        )
    };

    dispatcher.wait_all(&[hung, quick]).await;
    let outcomes = outcomes.lock().unwrap().clone();
    assert_eq!(outcomes.len(), 2);
    // The quick call finishes first even though it was submitted second
    assert_eq!(outcomes[0].id, quick);
    assert_eq!(outcomes[0].state, RequestState::Completed);
    assert_eq!(outcomes[1].id, hung);
    assert_eq!(outcomes[1].state, RequestState::Timeout);
}
