//! MCP JSON-RPC client over Streamable HTTP (spec §4.7 step 4 "MCP"): POST
//! `initialize`, capture the session header, POST `notifications/initialized`, then
//! POST `tools/call`. Tolerant of both a single JSON body and an SSE-framed response.
//!
//! Grounded on the teacher's `McpHttpSession` (`loom/src/tool_source/mcp/session_http.rs`),
//! but JSON-RPC envelopes are built directly with `serde_json` rather than the
//! teacher's `mcp_core` crate, since that crate is a private git dependency the gateway
//! has no other use for — the teacher's own session builds its request bodies with
//! `serde_json::json!` already, so nothing idiomatic is lost.

use std::sync::Mutex;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use super::{unwrap_arguments, ToolCallOutcome, ToolError};

/// MCP protocol version the gateway's own client declares (spec §4.7: literal `2025-06-18`,
/// distinct from whatever version an individual upstream server might otherwise assume).
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Default MCP call timeout (spec §4.7 "30 s (MCP) unless overridden").
pub const DEFAULT_MCP_TIMEOUT: Duration = Duration::from_secs(30);

const INITIALIZE_REQUEST_ID: &str = "gateway-mcp-initialize";

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcErrorBody>,
}

/// One open MCP HTTP session. Created fresh per tool dispatch in the current design
/// (no long-lived pool), matching the spec's per-call `initialize -> ... -> tools/call`
/// sequencing; session id reuse across calls is an optimization left to a future pool.
pub struct McpSession {
    client: reqwest::Client,
    url: String,
    session_id: Mutex<Option<String>>,
}

impl McpSession {
    pub async fn open(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Result<Self, ToolError> {
        let session = Self { client, url: url.into(), session_id: Mutex::new(None) };
        session.initialize(timeout).await?;
        Ok(session)
    }

    fn session_id_header(&self) -> Option<String> {
        self.session_id.lock().expect("session mutex poisoned").clone()
    }

    async fn post(&self, request_id: &str, method: &str, params: Value, timeout: Duration) -> Result<JsonRpcResponse, ToolError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params,
        });
        let mut req = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header("MCP-Protocol-Version", MCP_PROTOCOL_VERSION)
            .json(&body);
        if let Some(id) = self.session_id_header() {
            req = req.header("MCP-Session-Id", id);
        }
        let resp = req.send().await.map_err(|e| ToolError::Transport(e.to_string()))?;

        if let Some(id) = resp.headers().get("MCP-Session-Id").and_then(|v| v.to_str().ok()) {
            *self.session_id.lock().expect("session mutex poisoned") = Some(id.to_string());
        }

        if resp.status() == reqwest::StatusCode::ACCEPTED {
            return Ok(JsonRpcResponse { result: Some(Value::Null), error: None });
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ToolError::Transport(format!("mcp http {status}: {text}")));
        }

        let content_type = resp.headers().get("content-type").cloned();
        let text = resp.text().await.map_err(|e| ToolError::Transport(e.to_string()))?;
        parse_json_rpc_body(&text, content_type.as_ref())
    }

    async fn notify(&self, method: &str, params: Value, timeout: Duration) -> Result<(), ToolError> {
        let body = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        let mut req = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .header("MCP-Protocol-Version", MCP_PROTOCOL_VERSION)
            .json(&body);
        if let Some(id) = self.session_id_header() {
            req = req.header("MCP-Session-Id", id);
        }
        req.send().await.map_err(|e| ToolError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn initialize(&self, timeout: Duration) -> Result<(), ToolError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "clientInfo": { "name": "llamaswap-gateway", "version": env!("CARGO_PKG_VERSION") },
        });
        self.post(INITIALIZE_REQUEST_ID, "initialize", params, timeout).await?;
        self.notify("notifications/initialized", json!({}), timeout).await
    }

    /// `tools/call` (spec §4.7): `name` is `remoteName` if set, else `name` supplied in
    /// the unwrapped arguments; `arguments` is the unwrapped sub-object.
    pub async fn call_tool(
        &self,
        remote_name: Option<&str>,
        raw_arguments: Value,
        timeout: Duration,
    ) -> Result<ToolCallOutcome, ToolError> {
        let args = unwrap_arguments(&raw_arguments);
        let name = remote_name
            .map(str::to_string)
            .or_else(|| args.get("name").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| ToolError::Transport("mcp tool call missing a name".to_string()))?;

        let params = json!({ "name": name, "arguments": args });
        let response = self.post("gateway-mcp-call", "tools/call", params, timeout).await?;

        if let Some(err) = response.error {
            return Err(ToolError::CallFailed(err.message));
        }
        let result = response.result.unwrap_or(Value::Null);
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str)
            .or_else(|| result.get("text").and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();

        Ok(ToolCallOutcome { text, urls: Vec::new() })
    }
}

/// Parses a JSON-RPC response body that may be a plain JSON object or SSE-framed
/// (scans `data:` lines, keeping the last valid JSON-RPC message found).
fn parse_json_rpc_body(body: &str, content_type: Option<&reqwest::header::HeaderValue>) -> Result<JsonRpcResponse, ToolError> {
    let is_sse = content_type
        .and_then(|v| v.to_str().ok())
        .map(|s| s.contains("text/event-stream"))
        .unwrap_or(false);

    if !is_sse {
        return serde_json::from_str(body).map_err(|e| ToolError::Transport(format!("mcp response json: {e}")));
    }

    let mut last: Option<JsonRpcResponse> = None;
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else { continue };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        if let Ok(parsed) = serde_json::from_str::<JsonRpcResponse>(data) {
            if parsed.result.is_some() || parsed.error.is_some() {
                last = Some(parsed);
            }
        }
    }
    last.ok_or_else(|| ToolError::Transport("mcp sse stream: no json-rpc response found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn drain_request(stream: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut tmp = [0u8; 1024];
        loop {
            let n = stream.read(&mut tmp).await.unwrap();
            buf.extend_from_slice(&tmp[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
                break;
            }
        }
    }

    async fn write_response(stream: &mut TcpStream, content_type: &str, body: &str) {
        let resp = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: {content_type}\r\nMCP-Session-Id: sess-1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        stream.write_all(resp.as_bytes()).await.unwrap();
    }

    /// Serves `connections` sequential requests, each getting `response_body` back with
    /// `Connection: close` (spec §4.7 calls out three legs per dispatch: initialize,
    /// notifications/initialized, tools/call).
    async fn spawn_stub(response_body: &'static str, content_type: &'static str, connections: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for _ in 0..connections {
                let (mut stream, _) = listener.accept().await.unwrap();
                drain_request(&mut stream).await;
                write_response(&mut stream, content_type, response_body).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn initialize_and_call_tool_over_plain_json() {
        let body = r#"{"jsonrpc":"2.0","id":"gateway-mcp-call","result":{"content":[{"type":"text","text":"42"}]}}"#;
        let url = spawn_stub(body, "application/json", 3).await;
        let session = McpSession::open(reqwest::Client::new(), url, Duration::from_secs(5)).await.unwrap();
        let outcome = session
            .call_tool(Some("add"), serde_json::json!({"a":1,"b":2}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.text, "42");
        assert_eq!(session.session_id_header().as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn call_tool_parses_sse_framed_response() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"id\":\"gateway-mcp-call\",\"result\":{\"text\":\"ok\"}}\n\n";
        let url = spawn_stub(body, "text/event-stream", 3).await;
        let session = McpSession::open(reqwest::Client::new(), url, Duration::from_secs(5)).await.unwrap();
        let outcome = session
            .call_tool(Some("ping"), serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.text, "ok");
    }

    #[tokio::test]
    async fn call_tool_surfaces_error_message() {
        let body = r#"{"jsonrpc":"2.0","id":"gateway-mcp-call","error":{"code":-1,"message":"boom"}}"#;
        let url = spawn_stub(body, "application/json", 3).await;
        let session = McpSession::open(reqwest::Client::new(), url, Duration::from_secs(5)).await.unwrap();
        let err = session
            .call_tool(Some("broken"), serde_json::json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::CallFailed(msg) if msg == "boom"));
    }
}
