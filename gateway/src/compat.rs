//! Compatibility Layer (spec §4.1): endpoint router, canonical request projection,
//! and the capability gate.

use serde_json::Value;

use crate::error::GatewayError;

/// `endpointKind` (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Responses,
    ChatCompletions,
    Completions,
    Messages,
    Embeddings,
    Images,
    AudioSpeech,
    AudioVoice,
    AudioTranscribe,
    Rerank,
    Infill,
    Completion,
    Unknown,
}

/// `route(path) → endpointKind` (spec §4.1).
pub fn route(path: &str) -> EndpointKind {
    let path = path.trim_end_matches('/');
    match path {
        "/v1/responses" => EndpointKind::Responses,
        "/v1/chat/completions" => EndpointKind::ChatCompletions,
        "/v1/completions" => EndpointKind::Completions,
        "/v1/messages" | "/v1/messages/count_tokens" => EndpointKind::Messages,
        "/v1/embeddings" => EndpointKind::Embeddings,
        "/v1/images/generations" | "/v1/images/edits" => EndpointKind::Images,
        "/v1/audio/speech" => EndpointKind::AudioSpeech,
        "/v1/audio/voices" => EndpointKind::AudioVoice,
        "/v1/audio/transcriptions" => EndpointKind::AudioTranscribe,
        "/v1/rerank" | "/v1/reranking" | "/rerank" | "/reranking" => EndpointKind::Rerank,
        "/infill" => EndpointKind::Infill,
        "/completion" => EndpointKind::Completion,
        _ => EndpointKind::Unknown,
    }
}

/// Endpoint capability gate (spec §4.1 `EndpointCapability`).
#[derive(Debug, Clone, Copy)]
pub struct EndpointCapability {
    pub streaming: bool,
    pub tools: bool,
}

impl EndpointKind {
    pub fn capability(self) -> EndpointCapability {
        use EndpointKind::*;
        match self {
            Responses | ChatCompletions | Messages => EndpointCapability { streaming: true, tools: true },
            Completions | Completion | Infill => EndpointCapability { streaming: true, tools: false },
            Embeddings | Images | AudioSpeech | AudioVoice | AudioTranscribe | Rerank => {
                EndpointCapability { streaming: false, tools: false }
            }
            Unknown => EndpointCapability { streaming: false, tools: false },
        }
    }
}

/// Projected request shape the rest of the data plane operates on (spec §4.1 `CanonicalRequest`).
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    pub endpoint: EndpointKind,
    pub model: Option<String>,
    pub input: Option<String>,
    pub stream: bool,
    pub has_tools: bool,
}

/// Validation mode (spec §4.1 "strict_openai makes validation mandatory; legacy is permissive").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Strict,
    Legacy,
}

/// Result of [`normalize`]: the (possibly rewritten) body, the endpoint kind, and the
/// canonical projection.
pub struct NormalizeOutcome {
    pub body: Value,
    pub kind: EndpointKind,
    pub canonical: CanonicalRequest,
}

fn last_user_content(messages: &[Value]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
        .and_then(|m| content_to_string(m.get("content")))
}

fn content_to_string(content: Option<&Value>) -> Option<String> {
    match content {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(parts)) => {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("");
            if text.is_empty() { None } else { Some(text) }
        }
        _ => None,
    }
}

/// `normalize(request, body) → {body, kind, canonical}` (spec §4.1). Forces
/// `Content-Type: application/json` and defaults `Accept` to JSON via the returned
/// header plan (applied by the dispatcher), strips chunked markers, and projects the
/// canonical request by endpoint-specific rules.
pub fn normalize(path: &str, mut body: Value) -> NormalizeOutcome {
    let kind = route(path);

    let model = body.get("model").and_then(Value::as_str).map(str::to_string);
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let has_tools = body
        .get("tools")
        .and_then(Value::as_array)
        .map(|t| !t.is_empty())
        .unwrap_or(false);

    let input = match kind {
        EndpointKind::ChatCompletions | EndpointKind::Messages => body
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|m| last_user_content(m)),
        EndpointKind::Completions | EndpointKind::Completion | EndpointKind::Infill => {
            body.get("prompt").and_then(Value::as_str).map(str::to_string)
        }
        EndpointKind::Responses => match body.get("input") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(items)) => {
                let joined = items
                    .iter()
                    .filter(|i| i.get("role").and_then(Value::as_str) == Some("user"))
                    .filter_map(|i| content_to_string(i.get("content")))
                    .collect::<Vec<_>>()
                    .join("\n");
                if joined.is_empty() { None } else { Some(joined) }
            }
            _ => None,
        },
        _ => None,
    };

    if let Some(obj) = body.as_object_mut() {
        obj.remove("transfer-encoding");
    }

    NormalizeOutcome {
        body,
        kind,
        canonical: CanonicalRequest { endpoint: kind, model, input, stream, has_tools },
    }
}

/// `validate(canonical)` (spec §4.1): enforces the capability table, mandatory under
/// [`ValidationMode::Strict`], permissive under [`ValidationMode::Legacy`] (accepts anything
/// the capability table would reject, since legacy clients routinely over-request).
pub fn validate(canonical: &CanonicalRequest, mode: ValidationMode) -> Result<(), GatewayError> {
    if mode == ValidationMode::Legacy {
        return Ok(());
    }
    let cap = canonical.endpoint.capability();
    if canonical.has_tools && !cap.tools {
        return Err(GatewayError::InvalidRequest(
            "tools are not supported on this endpoint".to_string(),
        ));
    }
    if canonical.stream && !cap.streaming {
        return Err(GatewayError::InvalidRequest(
            "streaming is not supported on this endpoint".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_maps_known_paths() {
        assert!(matches!(route("/v1/chat/completions"), EndpointKind::ChatCompletions));
        assert!(matches!(route("/v1/responses"), EndpointKind::Responses));
        assert!(matches!(route("/rerank"), EndpointKind::Rerank));
        assert!(matches!(route("/nope"), EndpointKind::Unknown));
    }

    #[test]
    fn normalize_projects_last_user_message_for_chat() {
        let body = serde_json::json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": "second"}
            ]
        });
        let out = normalize("/v1/chat/completions", body);
        assert_eq!(out.canonical.input.as_deref(), Some("second"));
        assert_eq!(out.canonical.model.as_deref(), Some("m"));
    }

    #[test]
    fn normalize_projects_prompt_for_completions() {
        let body = serde_json::json!({"model": "m", "prompt": "finish this"});
        let out = normalize("/v1/completions", body);
        assert_eq!(out.canonical.input.as_deref(), Some("finish this"));
    }

    #[test]
    fn validate_strict_rejects_tools_on_embeddings() {
        let canonical = CanonicalRequest {
            endpoint: EndpointKind::Embeddings,
            model: Some("m".into()),
            input: None,
            stream: false,
            has_tools: true,
        };
        let err = validate(&canonical, ValidationMode::Strict).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn validate_legacy_is_permissive() {
        let canonical = CanonicalRequest {
            endpoint: EndpointKind::Embeddings,
            model: Some("m".into()),
            input: None,
            stream: true,
            has_tools: true,
        };
        assert!(validate(&canonical, ValidationMode::Legacy).is_ok());
    }

    #[test]
    fn normalize_then_validate_then_normalize_is_a_fixed_point() {
        let body = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let first = normalize("/v1/chat/completions", body.clone());
        validate(&first.canonical, ValidationMode::Strict).unwrap();
        let second = normalize("/v1/chat/completions", first.body.clone());
        assert_eq!(first.body, second.body);
        assert_eq!(first.canonical.input, second.canonical.input);
    }
}
