//! Remote tool gateways (MCP-style JSON-RPC over HTTP).

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::tool::ToolOutput;
use crate::error::{Result, WeftError};
use crate::llm::ToolSpec;
use crate::types::{MediaSource, ToolResultContent, ToolStatus};
use crate::util::retry::RetryPolicy;

/// JSON-RPC error code a gateway uses to ask the user to authorize an account.
pub const AUTH_REQUIRED_CODE: i64 = -32001;

/// A long-lived client for one remote tool endpoint.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    /// Endpoint label used in logs.
    fn name(&self) -> &str;

    async fn list_tools(&self) -> Result<Vec<ToolSpec>>;

    async fn call_tool(&self, remote_name: &str, input: Value) -> Result<ToolOutput>;
}

/// JSON-RPC 2.0 gateway client over HTTP POST.
///
/// Shares the process-wide pooled [`reqwest::Client`] and exposes only the
/// remote tools named in its allow-list (all tools when the list is empty).
pub struct HttpGatewayClient {
    name: String,
    endpoint: String,
    http: reqwest::Client,
    bearer_token: Option<String>,
    allowed: BTreeSet<String>,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl HttpGatewayClient {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            http,
            bearer_token: None,
            allowed: BTreeSet::new(),
            retry: RetryPolicy::default(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_allowed_tools<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn is_allowed(&self, remote_name: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(remote_name)
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let params = &params;
        self.retry
            .execute(method, || async move {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": method,
                    "params": params,
                });
                let mut request = self.http.post(&self.endpoint).json(&body);
                if let Some(token) = &self.bearer_token {
                    request = request.bearer_auth(token);
                }
                let response = request.send().await?;
                let status = response.status();
                if !status.is_success() {
                    let message = response.text().await.unwrap_or_default();
                    return Err(WeftError::Gateway {
                        status: status.as_u16(),
                        message,
                    });
                }
                let envelope: RpcResponse = response.json().await?;
                envelope.into_result()
            })
            .await
    }
}

#[async_trait]
impl ToolGateway for HttpGatewayClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let result = self.rpc("tools/list", json!({})).await?;
        let listed: ListToolsResult = serde_json::from_value(result)?;
        Ok(listed
            .tools
            .into_iter()
            .filter(|t| self.is_allowed(&t.name))
            .map(|t| ToolSpec {
                name: t.name,
                description: t.description.unwrap_or_default(),
                input_schema: t
                    .input_schema
                    .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
            })
            .collect())
    }

    async fn call_tool(&self, remote_name: &str, input: Value) -> Result<ToolOutput> {
        if !self.is_allowed(remote_name) {
            return Err(WeftError::ToolNotFound(format!(
                "{remote_name} (not exposed by gateway {})",
                self.name
            )));
        }
        tracing::debug!(gateway = %self.name, tool = remote_name, "calling gateway tool");
        let result = self
            .rpc("tools/call", json!({"name": remote_name, "arguments": input}))
            .await?;
        let call: CallToolResult = serde_json::from_value(result)?;
        Ok(call.into_output())
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl RpcResponse {
    fn into_result(self) -> Result<Value> {
        match (self.result, self.error) {
            (_, Some(err)) if err.code == AUTH_REQUIRED_CODE => {
                let data = err.data.unwrap_or(Value::Null);
                Err(WeftError::AuthRequired {
                    tool_name: data
                        .get("tool_name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    auth_url: data
                        .get("auth_url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            }
            (_, Some(err)) => Err(WeftError::Gateway {
                status: 200,
                message: format!("JSON-RPC error {}: {}", err.code, err.message),
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(WeftError::Gateway {
                status: 200,
                message: "JSON-RPC response without result".into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<RemoteTool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolResult {
    #[serde(default)]
    content: Vec<RemoteContent>,
    #[serde(default)]
    is_error: bool,
    #[serde(default, rename = "_meta")]
    meta: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RemoteContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
}

impl CallToolResult {
    fn into_output(self) -> ToolOutput {
        let content = self
            .content
            .into_iter()
            .map(|item| match item {
                RemoteContent::Text { text } => match serde_json::from_str::<Value>(&text) {
                    Ok(json @ Value::Object(_)) => ToolResultContent::Json { json },
                    _ => ToolResultContent::Text { text },
                },
                RemoteContent::Image { data, mime_type } => image_content(&data, &mime_type),
                RemoteContent::Resource { resource } => ToolResultContent::Json { json: resource },
            })
            .collect();
        ToolOutput {
            content,
            status: if self.is_error {
                ToolStatus::Error
            } else {
                ToolStatus::Success
            },
            metadata: self.meta,
        }
    }
}

fn image_content(data: &str, mime_type: &str) -> ToolResultContent {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    let format = mime_type
        .rsplit('/')
        .next()
        .unwrap_or("png")
        .to_string();
    match STANDARD.decode(data) {
        Ok(bytes) => ToolResultContent::Image {
            format,
            source: MediaSource::Bytes(bytes),
        },
        Err(_) => ToolResultContent::Text {
            text: format!("[unreadable {mime_type} image returned by tool]"),
        },
    }
}
