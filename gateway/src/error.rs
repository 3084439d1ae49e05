//! Canonical error envelope (spec §7) and the top-level [`GatewayError`] enum.
//!
//! Mirrors the teacher's composition style for error types (`RunError`/`AgentError`
//! in the teacher repo): small `thiserror` enums per component, `#[from]`-composed
//! into one type at the boundary that knows how to render the wire envelope.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

/// One pending tool call surfaced in a `tool_approval_required` conflict (spec §7, §4.7).
#[derive(Debug, Clone, Serialize)]
pub struct PendingToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Top-level gateway error. Each variant maps to one spec §7 `type` value.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    NotFound(String),

    #[error("tool approval required")]
    ToolApprovalRequired {
        header_name: String,
        tool_calls: Vec<PendingToolCall>,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Server(String),
}

impl GatewayError {
    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request_error",
            GatewayError::Authentication(_) => "authentication_error",
            GatewayError::NotFound(_) => "not_found_error",
            GatewayError::ToolApprovalRequired { .. } | GatewayError::Conflict(_) => {
                "conflict_error"
            }
            GatewayError::Server(_) => "server_error",
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            GatewayError::ToolApprovalRequired { .. } => "tool_approval_required",
            _ => self.error_type(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ToolApprovalRequired { .. } | GatewayError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            GatewayError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Derives the `type` value for an arbitrary HTTP status code (spec §4.2, used by the
    /// dispatcher when wrapping errors it did not originate, e.g. a raw upstream status).
    pub fn type_for_status(status: u16) -> &'static str {
        match status {
            400 | 415 => "invalid_request_error",
            401 | 403 => "authentication_error",
            404 => "not_found_error",
            409 => "conflict_error",
            429 => "rate_limit_error",
            s if s >= 500 => "server_error",
            _ => "invalid_request_error",
        }
    }

    pub fn to_envelope(&self) -> Value {
        let mut body = serde_json::json!({
            "message": self.to_string(),
            "type": self.error_type(),
            "code": self.error_code(),
        });
        if let GatewayError::ToolApprovalRequired { header_name, tool_calls } = self {
            let obj = body.as_object_mut().expect("object");
            obj.insert("header_name".to_string(), Value::String(header_name.clone()));
            obj.insert(
                "tool_calls".to_string(),
                serde_json::to_value(tool_calls).expect("serializable"),
            );
        }
        serde_json::json!({ "error": body })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = if status == StatusCode::UNAUTHORIZED {
            let mut r = axum::Json(self.to_envelope()).into_response();
            r.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Basic realm=\"llama-swap\""),
            );
            r
        } else {
            axum::Json(self.to_envelope()).into_response()
        };
        *response.status_mut() = status;
        response
    }
}
