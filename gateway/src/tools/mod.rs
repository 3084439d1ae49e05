//! Tool Registry & Executor (spec §2, §3 Tool/Tool runtime settings, §4.7 dispatch).
//!
//! `http_tool` and `mcp` implement the two transport kinds; `registry` owns the
//! on-disk catalog (`tools.json`) and enforces the `blockNonLocalEndpoints` safety
//! gate before any dispatch is attempted.

pub mod http_tool;
pub mod mcp;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;

pub use registry::{ToolCatalog, ToolCatalogError};

/// Unwraps a JSON value wrapped in an `arguments`/`args`/`input` envelope, since tool
/// calls arrive in several shapes depending on the model (spec §4.7 HTTP dispatch step).
pub fn unwrap_arguments(value: &Value) -> Value {
    for key in ["arguments", "args", "input"] {
        if let Some(inner) = value.get(key) {
            return inner.clone();
        }
    }
    value.clone()
}

/// Derives a `query` string from common argument aliases (spec §4.7).
pub fn derive_query(args: &Value) -> Option<String> {
    for key in ["query", "q", "search", "text", "prompt"] {
        if let Some(s) = args.get(key).and_then(Value::as_str) {
            return Some(s.to_string());
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool endpoint blocked: non-local host is not permitted")]
    NonLocalEndpointBlocked,
    #[error("tool transport error: {0}")]
    Transport(String),
    #[error("tool call failed: {0}")]
    CallFailed(String),
    #[error("tool not found: {0}")]
    NotFound(String),
}

/// One executed tool call's outcome, fed back into the Tool Loop as a `role=tool`
/// message (spec §4.7 step 5).
pub struct ToolCallOutcome {
    pub text: String,
    pub urls: Vec<String>,
}

/// Capability every dispatchable tool implements, mirroring the teacher's single
/// `Tool` trait (name/spec/call) generalized to the gateway's HTTP/MCP split
/// (spec §9 "Dynamic dispatch ... single capability").
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call(&self, tool_name: &str, arguments: Value) -> Result<ToolCallOutcome, ToolError>;
}
