//! Integration tests driving the MCP client against the mock server binary.

use std::time::Duration;

use serde_json::json;

use ensemble_mcp::{ConnectionState, McpClient, McpClientConfig, McpError, ServerSpec};

fn mock_spec(name: &str) -> ServerSpec {
    ServerSpec::new(name, env!("CARGO_BIN_EXE_mock_mcp_server"))
}

async fn connected_client(servers: Vec<ServerSpec>) -> (McpClient, tempfile::TempDir) {
    let workspace = tempfile::tempdir().unwrap();
    let client = McpClient::new(McpClientConfig::new(workspace.path(), servers));
    client.initialize().await.unwrap();
    (client, workspace)
}

#[tokio::test]
async fn initialize_caches_tool_names() {
    let (client, _ws) = connected_client(vec![mock_spec("claude")]).await;

    let status = client.status().await;
    let claude = &status["claude"];
    assert_eq!(claude.status, ConnectionState::Connected);
    assert!(claude.tools.iter().any(|t| t == "echo"));
    assert!(claude.last_ping.is_some());

    client.close().await;
}

#[tokio::test]
async fn call_returns_result_intact() {
    let (client, _ws) = connected_client(vec![mock_spec("claude")]).await;

    let result = client
        .call("claude", "echo", json!({"query": "react patterns"}), None)
        .await
        .unwrap();
    assert_eq!(result["echo"]["query"], "react patterns");

    client.close().await;
}

#[tokio::test]
async fn workspace_path_injected_for_scoped_servers() {
    let (client, ws) = connected_client(vec![mock_spec("memory")]).await;

    let result = client
        .call("memory", "echo", json!({"content": "remember this"}), None)
        .await
        .unwrap();
    assert_eq!(
        result["echo"]["workspace_path"],
        ws.path().to_string_lossy().as_ref()
    );

    client.close().await;
}

#[tokio::test]
async fn server_error_is_a_tool_error() {
    let (client, _ws) = connected_client(vec![mock_spec("claude")]).await;

    let err = client
        .call("claude", "fail", json!({}), None)
        .await
        .unwrap_err();
    match err {
        McpError::Tool {
            server,
            tool,
            message,
        } => {
            assert_eq!(server, "claude");
            assert_eq!(tool, "fail");
            assert_eq!(message, "mock tool failure");
        }
        other => panic!("expected tool error, got {other:?}"),
    }

    // Tool errors do not kill the subprocess; the next call still works.
    let result = client.call("claude", "echo", json!({}), None).await.unwrap();
    assert!(result["echo"].is_object());

    client.close().await;
}

#[tokio::test]
async fn call_to_unknown_server_is_a_connection_error() {
    let (client, _ws) = connected_client(vec![mock_spec("claude")]).await;

    let err = client
        .call("perplexity", "search", json!({}), None)
        .await
        .unwrap_err();
    assert!(err.is_connection(), "got {err:?}");

    client.close().await;
}

#[tokio::test]
async fn call_multiple_preserves_input_order() {
    // Two servers so the calls genuinely overlap: the slow first call must
    // still come back first in the result vector.
    let (client, _ws) = connected_client(vec![mock_spec("claude"), mock_spec("perplexity")]).await;

    let calls = vec![
        (
            "claude".to_string(),
            "slow_echo".to_string(),
            json!({"delay_ms": 300, "tag": "slow"}),
        ),
        (
            "perplexity".to_string(),
            "echo".to_string(),
            json!({"tag": "fast"}),
        ),
    ];
    let results = client.call_multiple(&calls).await;

    assert_eq!(results.len(), 2);
    let first = results[0].as_ref().unwrap();
    assert_eq!(first["echo"]["tag"], "slow");
    let second = results[1].as_ref().unwrap();
    assert_eq!(second["echo"]["tag"], "fast");

    client.close().await;
}

#[tokio::test]
async fn call_multiple_reports_partial_failures_inline() {
    let (client, _ws) = connected_client(vec![mock_spec("claude")]).await;

    let calls = vec![
        ("claude".to_string(), "echo".to_string(), json!({"n": 1})),
        ("claude".to_string(), "fail".to_string(), json!({})),
        ("claude".to_string(), "echo".to_string(), json!({"n": 3})),
    ];
    let results = client.call_multiple(&calls).await;

    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(McpError::Tool { .. })));
    assert!(results[2].is_ok());

    client.close().await;
}

#[tokio::test]
async fn progress_notifications_keep_the_call_alive() {
    let (client, _ws) = connected_client(vec![mock_spec("claude")]).await;

    let result = client
        .call(
            "claude",
            "slow_echo",
            json!({"delay_ms": 300, "heartbeat_ms": 50}),
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    assert_eq!(result["slow"], true);

    client.close().await;
}

#[tokio::test]
async fn silent_server_hits_the_global_timeout() {
    let workspace = tempfile::tempdir().unwrap();
    let client = McpClient::new(
        McpClientConfig::new(workspace.path(), vec![mock_spec("claude")]).without_reconnect(),
    );
    client.initialize().await.unwrap();

    let err = client
        .call(
            "claude",
            "silent",
            json!({}),
            Some(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(err.is_connection(), "got {err:?}");
    assert!(err.to_string().contains("timeout"), "got {err}");

    let status = client.status().await;
    assert_eq!(status["claude"].status, ConnectionState::Dead);

    client.close().await;
}

#[tokio::test]
async fn dying_server_is_respawned_and_the_call_retried_once() {
    let state_dir = tempfile::tempdir().unwrap();
    let state_file = state_dir.path().join("died.marker");
    let spec =
        mock_spec("memory").env("MOCK_STATE_FILE", state_file.to_string_lossy().to_string());

    let (client, _ws) = connected_client(vec![spec]).await;

    // First attempt kills the subprocess; auto-reconnect respawns it,
    // replays the handshake, and retries exactly once.
    let result = client
        .call("memory", "die_once", json!({}), None)
        .await
        .unwrap();
    assert_eq!(result["ok"], true);
    assert_eq!(result["attempt"], 2);

    let status = client.status().await;
    assert_eq!(status["memory"].status, ConnectionState::Connected);

    client.close().await;
}

#[tokio::test]
async fn dying_server_without_reconnect_surfaces_the_failure() {
    let workspace = tempfile::tempdir().unwrap();
    let client = McpClient::new(
        McpClientConfig::new(workspace.path(), vec![mock_spec("claude")]).without_reconnect(),
    );
    client.initialize().await.unwrap();

    let err = client
        .call("claude", "die", json!({}), None)
        .await
        .unwrap_err();
    assert!(err.is_connection(), "got {err:?}");

    client.close().await;
}

#[tokio::test]
async fn initialize_failure_lists_every_failing_server() {
    let workspace = tempfile::tempdir().unwrap();
    let servers = vec![
        ServerSpec::new("asimov", "/nonexistent/command/a"),
        ServerSpec::new("tree-sitter", "/nonexistent/command/b"),
    ];
    let client = McpClient::new(McpClientConfig::new(workspace.path(), servers));

    let err = client.initialize().await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("asimov"), "got {message}");
    assert!(message.contains("tree-sitter"), "got {message}");
}

#[tokio::test]
async fn close_is_idempotent() {
    let (client, _ws) = connected_client(vec![mock_spec("claude")]).await;
    client.close().await;
    client.close().await;

    // Calls after close fail as uninitialized.
    let err = client
        .call("claude", "echo", json!({}), None)
        .await
        .unwrap_err();
    assert!(err.is_connection());
}
