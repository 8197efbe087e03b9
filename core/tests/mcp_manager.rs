#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::Value;
use serde_json::json;
use tokio::sync::broadcast::Receiver;

use atelier_core::McpConnectionManager;
use atelier_core::McpEvent;
use atelier_core::mcp_connection_manager::ClientFactory;
use atelier_core::models::McpServerConfig;
use atelier_core::models::McpTransport;
use atelier_mcp_client::ListToolsResult;
use atelier_mcp_client::McpClient;
use atelier_mcp_client::McpClientError;
use atelier_mcp_client::Tool;

struct FakeClient {
    tools: Vec<Tool>,
    fail_listing: bool,
    hang_calls: bool,
    fail_close: bool,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl McpClient for FakeClient {
    async fn list_tools(
        &self,
        _timeout: Option<Duration>,
    ) -> atelier_mcp_client::Result<ListToolsResult> {
        if self.fail_listing {
            return Err(McpClientError::Protocol("listing rejected".to_string()));
        }
        Ok(ListToolsResult {
            tools: self.tools.clone(),
        })
    }

    async fn call_tool(
        &self,
        name: String,
        _arguments: Option<Value>,
        _timeout: Option<Duration>,
    ) -> atelier_mcp_client::Result<Value> {
        if self.hang_calls {
            std::future::pending::<()>().await;
        }
        Ok(json!({ "echo": name }))
    }

    async fn close(&self) -> atelier_mcp_client::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.fail_close {
            return Err(McpClientError::Protocol("close rejected".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeFactory {
    spawned: AtomicUsize,
    /// Server names whose connection attempt should fail.
    refuse: Vec<String>,
    /// Server names whose tool listing should fail after connecting.
    break_listing: Vec<String>,
    /// Server names whose tool calls never return.
    hang_calls: Vec<String>,
    /// Server names whose close should fail.
    break_close: Vec<String>,
    closed_flags: std::sync::Mutex<Vec<(String, Arc<AtomicBool>)>>,
}

impl FakeFactory {
    fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    fn was_closed(&self, name: &str) -> bool {
        self.closed_flags
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .any(|(_, flag)| flag.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn connect(
        &self,
        config: &McpServerConfig,
    ) -> atelier_mcp_client::Result<Box<dyn McpClient>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        if self.refuse.contains(&config.name) {
            return Err(McpClientError::Protocol("connection refused".to_string()));
        }
        let closed = Arc::new(AtomicBool::new(false));
        self.closed_flags
            .lock()
            .unwrap()
            .push((config.name.clone(), Arc::clone(&closed)));
        Ok(Box::new(FakeClient {
            tools: vec![Tool {
                name: format!("{}_tool", config.name),
                description: None,
                input_schema: json!({ "type": "object" }),
            }],
            fail_listing: self.break_listing.contains(&config.name),
            hang_calls: self.hang_calls.contains(&config.name),
            fail_close: self.break_close.contains(&config.name),
            closed,
        }))
    }
}

fn stdio_config(id: i64, name: &str) -> McpServerConfig {
    McpServerConfig {
        id,
        name: name.to_string(),
        transport: McpTransport::Stdio,
        command: Some("mcp-server".to_string()),
        args: Vec::new(),
        env: HashMap::new(),
        url: None,
        is_enabled: true,
        created_at: String::new(),
        updated_at: String::new(),
    }
}

fn drain_events(rx: &mut Receiver<McpEvent>) -> Vec<McpEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn invalid_config_is_rejected_before_any_spawn() {
    let factory = Arc::new(FakeFactory::default());
    let manager = McpConnectionManager::with_factory(factory.clone());

    let mut config = stdio_config(1, "broken");
    config.command = None;

    let err = manager.add_server(&config).await.unwrap_err();
    assert!(err.to_string().contains("requires a command"));
    assert_eq!(factory.spawn_count(), 0);
}

#[tokio::test]
async fn disabled_config_is_a_noop() {
    let factory = Arc::new(FakeFactory::default());
    let manager = McpConnectionManager::with_factory(factory.clone());

    let mut config = stdio_config(1, "dormant");
    config.is_enabled = false;

    manager.add_server(&config).await.unwrap();
    assert_eq!(factory.spawn_count(), 0);
    assert!(manager.connected_servers().await.is_empty());
}

#[tokio::test]
async fn failed_connection_emits_server_error() {
    let factory = Arc::new(FakeFactory {
        refuse: vec!["flaky".to_string()],
        ..FakeFactory::default()
    });
    let manager = McpConnectionManager::with_factory(factory);
    let mut rx = manager.subscribe();

    assert!(manager.add_server(&stdio_config(7, "flaky")).await.is_err());

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], McpEvent::ServerError { id: 7, .. }));
    assert!(manager.connected_servers().await.is_empty());
}

#[tokio::test]
async fn aggregate_listing_survives_one_broken_server() {
    let factory = Arc::new(FakeFactory {
        break_listing: vec!["broken".to_string()],
        ..FakeFactory::default()
    });
    let manager = McpConnectionManager::with_factory(factory);

    manager.add_server(&stdio_config(1, "healthy")).await.unwrap();
    manager.add_server(&stdio_config(2, "broken")).await.unwrap();

    let mut rx = manager.subscribe();
    let tools = manager.get_tools(None).await;

    let names: Vec<&str> = tools.iter().map(|t| t.tool.name.as_str()).collect();
    assert_eq!(names, vec!["healthy_tool"]);

    let errors = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, McpEvent::ServerError { .. }))
        .count();
    assert_eq!(errors, 1);
}

#[tokio::test]
async fn scoped_listing_of_unknown_server_is_empty() {
    let factory = Arc::new(FakeFactory::default());
    let manager = McpConnectionManager::with_factory(factory);

    manager.add_server(&stdio_config(1, "healthy")).await.unwrap();
    assert!(manager.get_tools(Some(99)).await.is_empty());
    assert_eq!(manager.get_tools(Some(1)).await.len(), 1);
}

#[tokio::test]
async fn call_tool_on_unknown_server_is_not_found() {
    let manager = McpConnectionManager::with_factory(Arc::new(FakeFactory::default()));
    let err = manager
        .call_tool(42, "anything".to_string(), None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "no connected server with id 42");
}

#[tokio::test]
async fn call_tool_reaches_the_right_server() {
    let manager = McpConnectionManager::with_factory(Arc::new(FakeFactory::default()));
    manager.add_server(&stdio_config(1, "files")).await.unwrap();

    let result = manager
        .call_tool(1, "read_file".to_string(), Some(json!({ "path": "/tmp/x" })))
        .await
        .unwrap();
    assert_eq!(result, json!({ "echo": "read_file" }));
}

#[tokio::test]
async fn test_connection_reports_reachability_without_erroring() {
    let factory = Arc::new(FakeFactory {
        refuse: vec!["down".to_string()],
        break_listing: vec!["half-up".to_string()],
        ..FakeFactory::default()
    });
    let manager = McpConnectionManager::with_factory(factory);

    assert!(manager.test_connection(&stdio_config(0, "up")).await);
    assert!(!manager.test_connection(&stdio_config(0, "down")).await);
    assert!(!manager.test_connection(&stdio_config(0, "half-up")).await);

    let mut invalid = stdio_config(0, "invalid");
    invalid.command = None;
    assert!(!manager.test_connection(&invalid).await);

    // Probes never become tracked connections.
    assert!(manager.connected_servers().await.is_empty());
}

#[tokio::test]
async fn replacing_a_server_closes_the_old_connection() {
    let factory = Arc::new(FakeFactory::default());
    let manager = McpConnectionManager::with_factory(factory.clone());

    manager.add_server(&stdio_config(1, "first")).await.unwrap();
    manager.add_server(&stdio_config(1, "second")).await.unwrap();

    assert!(factory.was_closed("first"));
    let servers = manager.connected_servers().await;
    assert_eq!(servers, vec![(1, "second".to_string())]);
}

#[tokio::test]
async fn remove_is_idempotent_and_emits_once() {
    let manager = McpConnectionManager::with_factory(Arc::new(FakeFactory::default()));
    manager.add_server(&stdio_config(1, "files")).await.unwrap();

    let mut rx = manager.subscribe();
    manager.remove_server(1).await.unwrap();
    manager.remove_server(1).await.unwrap();

    let removed = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, McpEvent::ServerRemoved { .. }))
        .count();
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn hung_server_stalls_only_its_own_operation() {
    let factory = Arc::new(FakeFactory {
        hang_calls: vec!["stuck".to_string()],
        ..FakeFactory::default()
    });
    let manager = Arc::new(McpConnectionManager::with_factory(factory));

    manager.add_server(&stdio_config(1, "stuck")).await.unwrap();
    manager.add_server(&stdio_config(2, "healthy")).await.unwrap();

    let stuck = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.call_tool(1, "never_returns".to_string(), None).await }
    });
    // Let the hung call reach its transport await.
    tokio::task::yield_now().await;

    let budget = Duration::from_secs(2);
    let result = tokio::time::timeout(
        budget,
        manager.call_tool(2, "ping".to_string(), None),
    )
    .await
    .expect("healthy server must not wait on the hung one")
    .unwrap();
    assert_eq!(result, json!({ "echo": "ping" }));

    // The hung connection can still be listed and evicted.
    tokio::time::timeout(budget, manager.connected_servers())
        .await
        .expect("registry reads must not block");
    tokio::time::timeout(budget, manager.remove_server(1))
        .await
        .expect("eviction must not block")
        .unwrap();
    assert_eq!(
        manager.connected_servers().await,
        vec![(2, "healthy".to_string())]
    );

    stuck.abort();
}

#[tokio::test]
async fn failing_close_on_remove_emits_server_error() {
    let factory = Arc::new(FakeFactory {
        break_close: vec!["grumpy".to_string()],
        ..FakeFactory::default()
    });
    let manager = McpConnectionManager::with_factory(factory);
    manager.add_server(&stdio_config(5, "grumpy")).await.unwrap();

    let mut rx = manager.subscribe();
    manager.remove_server(5).await.unwrap();

    let events = drain_events(&mut rx);
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], McpEvent::ServerError { id: 5, .. }));
    assert!(matches!(events[1], McpEvent::ServerRemoved { id: 5 }));
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let factory = Arc::new(FakeFactory::default());
    let manager = McpConnectionManager::with_factory(factory.clone());

    manager.add_server(&stdio_config(1, "a")).await.unwrap();
    manager.add_server(&stdio_config(2, "b")).await.unwrap();

    let mut rx = manager.subscribe();
    manager.shutdown().await;

    assert!(factory.was_closed("a"));
    assert!(factory.was_closed("b"));
    assert!(manager.connected_servers().await.is_empty());
    let removed = drain_events(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, McpEvent::ServerRemoved { .. }))
        .count();
    assert_eq!(removed, 2);
}
