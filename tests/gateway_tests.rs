//! JSON-RPC gateway client against a mock HTTP endpoint.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::{drain, Script, ScriptedProvider};
use weft::error::WeftError;
use weft::runtime::RuntimeContext;
use weft::stream::{AgentEvent, EventSink};
use weft::tools::{HttpGatewayClient, ToolGateway, ToolRegistry};
use weft::turn::{TurnRequest, TurnStatus};
use weft::types::{ToolResultContent, ToolStatus};
use weft::util::retry::RetryPolicy;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        multiplier: 2.0,
    }
}

fn client(server: &MockServer) -> HttpGatewayClient {
    HttpGatewayClient::new("workspace", format!("{}/rpc", server.uri()), reqwest::Client::new())
        .with_retry(fast_retry())
}

fn rpc_result(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

async fn mount_tool_list(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(rpc_result(json!({
            "tools": [
                {"name": "read_file", "description": "Read a workspace file",
                 "inputSchema": {"type": "object", "properties": {"path": {"type": "string"}}}},
                {"name": "delete_file", "description": "Delete a workspace file"}
            ]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn list_tools_applies_the_allow_list() {
    let server = MockServer::start().await;
    mount_tool_list(&server).await;

    let all = client(&server).list_tools().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[1].input_schema["type"], "object");

    let filtered = client(&server)
        .with_allowed_tools(["read_file"])
        .list_tools()
        .await
        .unwrap();
    let names: Vec<_> = filtered.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["read_file"]);
}

#[tokio::test]
async fn call_tool_maps_content_and_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({
            "method": "tools/call",
            "params": {"name": "read_file", "arguments": {"path": "notes.md"}}
        })))
        .respond_with(rpc_result(json!({
            "content": [
                {"type": "text", "text": "# Notes"},
                {"type": "text", "text": "{\"lines\": 1}"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let output = client(&server)
        .with_bearer_token("secret")
        .call_tool("read_file", json!({"path": "notes.md"}))
        .await
        .unwrap();

    assert_eq!(output.status, ToolStatus::Success);
    assert_eq!(
        output.content,
        vec![
            ToolResultContent::Text {
                text: "# Notes".into()
            },
            ToolResultContent::Json {
                json: json!({"lines": 1})
            },
        ]
    );
}

#[tokio::test]
async fn tool_error_flag_becomes_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(rpc_result(json!({
            "content": [{"type": "text", "text": "no such file"}],
            "isError": true
        })))
        .mount(&server)
        .await;

    let output = client(&server)
        .call_tool("read_file", json!({"path": "missing.md"}))
        .await
        .unwrap();
    assert_eq!(output.status, ToolStatus::Error);
}

#[tokio::test]
async fn auth_error_code_surfaces_as_auth_required() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {
                "code": -32001,
                "message": "authorization required",
                "data": {"tool_name": "gmail_search", "auth_url": "https://auth.example/start"}
            }
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .call_tool("gmail_search", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WeftError::AuthRequired { ref tool_name, ref auth_url }
            if tool_name == "gmail_search" && auth_url == "https://auth.example/start"
    ));
}

#[tokio::test]
async fn transient_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(rpc_result(json!({"content": [{"type": "text", "text": "ok"}]})))
        .expect(1)
        .mount(&server)
        .await;

    let output = client(&server).call_tool("read_file", json!({})).await.unwrap();
    assert_eq!(output.status, ToolStatus::Success);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
        .expect(1)
        .mount(&server)
        .await;

    let err = client(&server).call_tool("read_file", json!({})).await.unwrap_err();
    assert!(matches!(err, WeftError::Gateway { status: 400, .. }));
}

#[tokio::test]
async fn gateway_tools_run_inside_a_turn() {
    let server = MockServer::start().await;
    mount_tool_list(&server).await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(rpc_result(json!({"content": [{"type": "text", "text": "file body"}]})))
        .mount(&server)
        .await;

    let gateway = Arc::new(client(&server).with_allowed_tools(["read_file"]));
    let registry = ToolRegistry::builder()
        .gateway(gateway)
        .await
        .unwrap()
        .build()
        .unwrap();
    let provider = ScriptedProvider::new(vec![
        Script::tool_call("t1", "read_file", json!({"path": "a.md"})),
        Script::text("The file says: file body"),
    ]);
    let runtime = RuntimeContext::builder()
        .llm(provider.clone())
        .registry(registry)
        .build();
    let (sink, mut rx) = EventSink::channel(256);
    let request = TurnRequest::builder()
        .user_id("u1")
        .session_id("s1")
        .message("read a.md")
        .build();

    let outcome = runtime.run_turn(request, &sink).await;

    assert_eq!(outcome.status, TurnStatus::Completed);
    assert_eq!(provider.requests()[0].tools.len(), 1);
    let results: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            AgentEvent::ToolResult { content, .. } => Some(content),
            _ => None,
        })
        .collect();
    assert_eq!(
        results,
        vec![vec![ToolResultContent::Text {
            text: "file body".into()
        }]]
    );
}
