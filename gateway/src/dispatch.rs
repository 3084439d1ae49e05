//! Proxy Dispatcher (spec §4.2): the core request pipeline tying together the
//! Compatibility Layer, model resolution, the Prompt Optimizer, the Process Group
//! Manager, the Tool Loop, and the Responses Bridge.

use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use gwconfig::{GatewayConfig, ModelDescriptor, PromptPolicy, ToolRuntimeSettings, TruncationMode};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::activity::{ActivityKind, ActivityRing, RecordActivity};
use crate::compat::{self, EndpointKind, ValidationMode};
use crate::error::GatewayError;
use crate::events::EventBus;
use crate::model::{FitCtxMode, RuntimeOverrides};
use crate::ollama::OllamaAdapter;
use crate::optimize;
use crate::process::{ProcessGroupManager, StopStrategy};
use crate::responses;
use crate::toolloop::{self, InnerHandler, ToolLoopParams};
use crate::tools::registry::ToolCatalog;

/// Response headers set on every inference call (spec §4.2 "Headers set on response").
pub const HEADER_PROMPT_OPTIMIZATION_POLICY: &str = "X-LlamaSwap-Prompt-Optimization-Policy";
pub const HEADER_PROMPT_OPTIMIZED: &str = "X-LlamaSwap-Prompt-Optimized";

/// Maps that move together during a swap: per-model runtime overrides and the process
/// group topology (spec §5 "single process-wide mutex ... guards the dispatcher's
/// mutable maps"). Tool catalog, ollama cache, and the activity ring each carry their
/// own lock instead of sharing this one — none of their mutations need to be atomic
/// with a process swap, and splitting them avoids a single contended mutex guarding
/// unrelated state (documented as a deliberate refinement in DESIGN.md).
pub struct DispatcherMaps {
    pub process_manager: ProcessGroupManager,
    pub ctx_sizes: HashMap<String, u32>,
    pub fit_modes: HashMap<String, bool>,
    pub fit_ctx_modes: HashMap<String, FitCtxMode>,
    pub prompt_policies: HashMap<String, PromptPolicy>,
    pub latest_prompt_optimizations: HashMap<String, crate::model::PromptSnapshot>,
}

impl DispatcherMaps {
    pub fn new(process_manager: ProcessGroupManager) -> Self {
        Self {
            process_manager,
            ctx_sizes: HashMap::new(),
            fit_modes: HashMap::new(),
            fit_ctx_modes: HashMap::new(),
            prompt_policies: HashMap::new(),
            latest_prompt_optimizations: HashMap::new(),
        }
    }

    /// Restart (spec §6 `POST /api/restart`, "soft: clears runtime overrides ..."): drops
    /// every per-model override, leaving group topology untouched.
    pub fn clear_runtime_overrides(&mut self) {
        self.ctx_sizes.clear();
        self.fit_modes.clear();
        self.fit_ctx_modes.clear();
        self.prompt_policies.clear();
    }
}

/// Top-level gateway state, one instance shared across the whole process (spec §5).
pub struct GatewayState {
    pub config: tokio::sync::RwLock<GatewayConfig>,
    pub maps: AsyncMutex<DispatcherMaps>,
    pub tool_catalog: AsyncMutex<ToolCatalog>,
    pub activity: ActivityRing,
    pub ollama: OllamaAdapter,
    pub events: EventBus,
    pub http_client: reqwest::Client,
    pub health_check_timeout: Duration,
}

/// Resolved dispatch target (spec §4.2 step 4).
pub enum ResolvedTarget {
    Local(ModelDescriptor),
    Peer { base_url: String, model_name: String },
    Ollama(crate::model::OllamaModel),
}

/// Precedence chain for model resolution (spec §4.2 step 4): configured model (by id or
/// alias); for `responses` a literal `"localhost"` maps to the configured fallback model;
/// the first ready local model; a peer's advertised model; `ollama/<name>`; else error.
pub fn resolve_model(
    config: &GatewayConfig,
    requested: Option<&str>,
    endpoint: EndpointKind,
    first_ready_model_id: Option<&str>,
    ollama_models: &[crate::model::OllamaModel],
) -> Result<ResolvedTarget, GatewayError> {
    if let Some(req) = requested {
        if let Some(model) = config
            .models
            .iter()
            .find(|m| m.id == req || m.aliases.iter().any(|a| a == req))
        {
            return Ok(ResolvedTarget::Local(model.clone()));
        }
    }

    if requested == Some("localhost") && endpoint == EndpointKind::Responses {
        if let Some(fallback) = &config.settings.fallback_model {
            if let Some(model) = config.models.iter().find(|m| &m.id == fallback) {
                return Ok(ResolvedTarget::Local(model.clone()));
            }
        }
    }

    if requested.is_none() {
        if let Some(id) = first_ready_model_id {
            if let Some(model) = config.models.iter().find(|m| m.id == id) {
                return Ok(ResolvedTarget::Local(model.clone()));
            }
        }
    }

    if let Some(req) = requested {
        for peer in &config.peers {
            if peer.models.iter().any(|m| m == req) {
                return Ok(ResolvedTarget::Peer { base_url: peer.base_url.clone(), model_name: req.to_string() });
            }
        }

        if let Some(name) = req.strip_prefix("ollama/") {
            if let Some(model) = ollama_models.iter().find(|m| m.name == name) {
                return Ok(ResolvedTarget::Ollama(model.clone()));
            }
            return Ok(ResolvedTarget::Ollama(crate::model::OllamaModel {
                id: req.to_string(),
                name: name.to_string(),
                ctx_reference: None,
            }));
        }
    }

    Err(GatewayError::NotFound(format!(
        "no model, peer, or ollama model resolves key {:?}",
        requested
    )))
}

/// Applies `Filters` (spec §4.2 step 5): re-points `model`, strips, then overwrites.
pub fn apply_filters(mut body: Value, model: &ModelDescriptor) -> Value {
    if let Some(obj) = body.as_object_mut() {
        if let Some(use_name) = &model.use_model_name {
            obj.insert("model".to_string(), Value::String(use_name.clone()));
        }
        for key in &model.filters.strip_params {
            obj.remove(key);
        }
        for (key, value) in model.filters.set_params.iter() {
            obj.insert(key.clone(), value.clone());
        }
    }
    body
}

/// Decompresses `body` per `Content-Encoding` (spec §4.2 step 2: "take first token of
/// comma list").
pub fn decompress_body(body: Bytes, content_encoding: Option<&str>) -> Result<Bytes, GatewayError> {
    let Some(header) = content_encoding else { return Ok(body) };
    let first = header.split(',').next().unwrap_or("").trim().to_lowercase();
    match first.as_str() {
        "" | "identity" => Ok(body),
        "gzip" => {
            let mut decoder = flate2::read::GzDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| GatewayError::InvalidRequest(format!("invalid gzip body: {e}")))?;
            Ok(Bytes::from(out))
        }
        "deflate" => {
            let mut decoder = flate2::read::DeflateDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| GatewayError::InvalidRequest(format!("invalid deflate body: {e}")))?;
            Ok(Bytes::from(out))
        }
        "zstd" => {
            let out = zstd::stream::decode_all(&body[..])
                .map_err(|e| GatewayError::InvalidRequest(format!("invalid zstd body: {e}")))?;
            Ok(Bytes::from(out))
        }
        other => Err(GatewayError::InvalidRequest(format!("unsupported content-encoding {other}"))),
    }
}

/// Invokes a resolved local process's `/v1/chat/completions` (or equivalent) endpoint
/// with a JSON body, used both for direct forwarding and as the Tool Loop's backend.
struct UpstreamHandler<'a> {
    client: &'a reqwest::Client,
    base_url: String,
    path: &'a str,
}

#[async_trait]
impl<'a> InnerHandler for UpstreamHandler<'a> {
    async fn invoke(&self, request: Value) -> Result<Value, GatewayError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), self.path);
        let resp = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::Server(format!("upstream request failed: {e}")))?;
        let status = resp.status();
        let value: Value = resp
            .json()
            .await
            .map_err(|e| GatewayError::Server(format!("upstream response was not json: {e}")))?;
        if !status.is_success() {
            return Err(GatewayError::Server(format!("upstream returned {status}: {value}")));
        }
        Ok(value)
    }
}

/// Inputs to one dispatch call, already decompressed/parsed (spec §4.2).
pub struct DispatchRequest {
    pub path: String,
    pub body: Value,
    pub tool_approval_interactive_requested: bool,
    pub tool_approval_granted: bool,
    pub user_agent: Option<String>,
}

pub struct DispatchOutcome {
    pub body: Value,
    pub headers: HeaderMap,
}

/// Runs the spec §4.2 order of operations (steps 3-9; steps 1-2 are handled by the
/// `http` layer before this is called).
pub async fn dispatch(state: &GatewayState, request: DispatchRequest) -> Result<DispatchOutcome, GatewayError> {
    let config = state.config.read().await.clone();
    let normalized = compat::normalize(&request.path, request.body);
    let validation_mode = if config.settings.strict_openai { ValidationMode::Strict } else { ValidationMode::Legacy };
    compat::validate(&normalized.canonical, validation_mode)?;

    let first_ready_model_id = {
        let maps = state.maps.lock().await;
        maps.process_manager
            .groups
            .values()
            .flat_map(|g| g.members.iter())
            .find(|p| p.state() == crate::model::ProcessState::Ready)
            .map(|p| p.model_id.clone())
    };
    let ollama_models = state.ollama.models();

    let target = resolve_model(
        &config,
        normalized.canonical.model.as_deref(),
        normalized.kind,
        first_ready_model_id.as_deref(),
        &ollama_models,
    )?;

    match target {
        ResolvedTarget::Peer { base_url, model_name } => {
            let mut body = normalized.body;
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".to_string(), Value::String(model_name.clone()));
            }
            let last_user_prompt = last_user_message_content(&body);
            let handler = UpstreamHandler { client: &state.http_client, base_url, path: &request.path };
            let response = handler.invoke(body).await?;

            // Peers are the one target spec §4.2 step 6 excludes from prompt optimization;
            // activity recording has no such carve-out.
            state.activity.record(RecordActivity {
                model: &model_name,
                kind: ActivityKind::UserRequest,
                path: &request.path,
                last_role: "user",
                last_user_prompt: &last_user_prompt,
                message_count: 1,
                user_agent: request.user_agent.clone(),
            });

            let mut headers = HeaderMap::new();
            headers.insert(HEADER_PROMPT_OPTIMIZATION_POLICY, "off".parse().unwrap());
            headers.insert(HEADER_PROMPT_OPTIMIZED, "false".parse().unwrap());
            Ok(DispatchOutcome { body: response, headers })
        }
        ResolvedTarget::Ollama(model) => {
            let mut body = apply_model_name(normalized.body, &model.name);
            if let Some(obj) = body.as_object_mut() {
                obj.insert("stream".to_string(), Value::Bool(false));
            }

            let base_url = state
                .ollama
                .current_endpoint()
                .ok_or_else(|| GatewayError::NotFound("no ollama endpoint discovered".to_string()))?;

            // No per-model prompt policy is configured for ollama models; only crop when a
            // context reference length was actually discovered, else the budget would be
            // an unknown zero.
            let policy = if model.ctx_reference.is_some() { PromptPolicy::LimitOnly } else { PromptPolicy::Off };
            let ctx_size = model.ctx_reference.unwrap_or(0);

            let optimize_outcome = optimize::apply(
                &state.http_client,
                &base_url,
                policy,
                ctx_size,
                config.settings.safety_margin,
                TruncationMode::SlidingWindow,
                body,
            )
            .await;

            {
                let mut maps = state.maps.lock().await;
                maps.latest_prompt_optimizations.insert(model.id.clone(), optimize_outcome.snapshot.clone());
            }

            let last_user_prompt = last_user_message_content(&optimize_outcome.body);
            let body_bytes = Bytes::from(serde_json::to_vec(&optimize_outcome.body).map_err(|e| {
                GatewayError::Server(format!("failed to encode ollama request: {e}"))
            })?);

            let raw = state.ollama.proxy(&request.path, Method::POST, HeaderMap::new(), body_bytes).await?;
            let (parts, raw_body) = raw.into_parts();
            let bytes = axum::body::to_bytes(raw_body, usize::MAX)
                .await
                .map_err(|e| GatewayError::Server(format!("ollama response read failed: {e}")))?;
            if !parts.status.is_success() {
                return Err(GatewayError::Server(format!(
                    "ollama upstream returned {}: {}",
                    parts.status,
                    String::from_utf8_lossy(&bytes)
                )));
            }
            let response: Value = serde_json::from_slice(&bytes)
                .map_err(|e| GatewayError::Server(format!("ollama response was not json: {e}")))?;

            state.activity.record(RecordActivity {
                model: &model.id,
                kind: ActivityKind::UserRequest,
                path: &request.path,
                last_role: "user",
                last_user_prompt: &last_user_prompt,
                message_count: 1,
                user_agent: request.user_agent.clone(),
            });

            let mut headers = HeaderMap::new();
            headers.insert(HEADER_PROMPT_OPTIMIZATION_POLICY, prompt_policy_header_value(optimize_outcome.snapshot.policy));
            headers.insert(
                HEADER_PROMPT_OPTIMIZED,
                optimize_outcome.snapshot.applied.to_string().parse().unwrap(),
            );
            Ok(DispatchOutcome { body: response, headers })
        }
        ResolvedTarget::Local(model) => dispatch_local(state, &config, &model, normalized.kind, normalized.body, &request).await,
    }
}

fn apply_model_name(mut body: Value, name: &str) -> Value {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(name.to_string()));
    }
    body
}

async fn dispatch_local(
    state: &GatewayState,
    config: &GatewayConfig,
    model: &ModelDescriptor,
    endpoint: EndpointKind,
    body: Value,
    request: &DispatchRequest,
) -> Result<DispatchOutcome, GatewayError> {
    let body = apply_filters(body, model);

    let (ctx_size, fit_ctx_mode, prompt_policy) = {
        let maps = state.maps.lock().await;
        let ctx_size = maps.ctx_sizes.get(&model.id).copied().or(model.ctx_size).unwrap_or(0);
        let fit_ctx_mode = maps.fit_ctx_modes.get(&model.id).copied();
        let policy = maps.prompt_policies.get(&model.id).copied().unwrap_or(model.prompt_policy);
        (ctx_size, fit_ctx_mode, policy)
    };
    let _ = fit_ctx_mode;

    let upstream_base = model
        .proxy_url
        .clone()
        .ok_or_else(|| GatewayError::Server(format!("model {} has no proxy_url configured", model.id)))?;

    let optimize_outcome = optimize::apply(
        &state.http_client,
        &upstream_base,
        prompt_policy,
        ctx_size,
        config.settings.safety_margin,
        model.truncation_mode,
        body,
    )
    .await;

    {
        let mut maps = state.maps.lock().await;
        maps.latest_prompt_optimizations.insert(model.id.clone(), optimize_outcome.snapshot.clone());
    }

    let overrides = {
        let maps = state.maps.lock().await;
        RuntimeOverrides {
            ctx_size: maps.ctx_sizes.get(&model.id).copied(),
            fit_enabled: maps.fit_modes.get(&model.id).copied().unwrap_or(false),
            fit_ctx_mode: maps.fit_ctx_modes.get(&model.id).copied(),
            prompt_policy: maps.prompt_policies.get(&model.id).copied(),
        }
    };

    let target_process = {
        let maps = state.maps.lock().await;
        maps.process_manager
            .swap(&model.id, overrides, &config.tool_settings, StopStrategy::StopWaitForInflightRequest)
            .await?
            .target
    };

    target_process
        .ensure_ready(&state.http_client, &upstream_base, state.health_check_timeout)
        .await
        .map_err(GatewayError::Server)?;

    let last_user_prompt = last_user_message_content(&optimize_outcome.body);

    let tool_catalog_tools = {
        let catalog = state.tool_catalog.lock().await;
        catalog.tools.clone()
    };
    let has_tools = optimize_outcome
        .body
        .get("tools")
        .and_then(Value::as_array)
        .map(|t| !t.is_empty())
        .unwrap_or(false)
        || !tool_catalog_tools.is_empty();

    let response_body = match endpoint {
        EndpointKind::ChatCompletions if has_tools && config.tool_settings.enabled => {
            let handler = UpstreamHandler { client: &state.http_client, base_url: upstream_base.clone(), path: &request.path };
            let params = ToolLoopParams {
                tools: &tool_catalog_tools,
                settings: &config.tool_settings,
                approval_interactive_requested: request.tool_approval_interactive_requested,
                approval_granted: request.tool_approval_granted,
                approval_header_name: config.tool_settings.approval_header_name.clone(),
            };
            toolloop::run(&state.http_client, &handler, optimize_outcome.body, &params).await?
        }
        EndpointKind::Responses => {
            let chat_request = responses::to_chat_completions(&optimize_outcome.body);
            let handler = UpstreamHandler {
                client: &state.http_client,
                base_url: upstream_base.clone(),
                path: "/v1/chat/completions",
            };
            let chat_response = if has_tools && config.tool_settings.enabled {
                let params = ToolLoopParams {
                    tools: &tool_catalog_tools,
                    settings: &config.tool_settings,
                    approval_interactive_requested: request.tool_approval_interactive_requested,
                    approval_granted: request.tool_approval_granted,
                    approval_header_name: config.tool_settings.approval_header_name.clone(),
                };
                toolloop::run(&state.http_client, &handler, chat_request, &params).await?
            } else {
                handler.invoke(chat_request).await?
            };
            responses::to_response(&chat_response)
        }
        _ => {
            let handler = UpstreamHandler { client: &state.http_client, base_url: upstream_base.clone(), path: &request.path };
            handler.invoke(optimize_outcome.body).await?
        }
    };

    state.activity.record(RecordActivity {
        model: &model.id,
        kind: ActivityKind::UserRequest,
        path: &request.path,
        last_role: "user",
        last_user_prompt: &last_user_prompt,
        message_count: 1,
        user_agent: request.user_agent.clone(),
    });

    let mut headers = HeaderMap::new();
    headers.insert(HEADER_PROMPT_OPTIMIZATION_POLICY, prompt_policy_header_value(optimize_outcome.snapshot.policy));
    headers.insert(
        HEADER_PROMPT_OPTIMIZED,
        optimize_outcome.snapshot.applied.to_string().parse().unwrap(),
    );

    Ok(DispatchOutcome { body: response_body, headers })
}

fn prompt_policy_header_value(policy: PromptPolicy) -> axum::http::HeaderValue {
    let name = match policy {
        PromptPolicy::Off => "off",
        PromptPolicy::LimitOnly => "limit_only",
        PromptPolicy::Always => "always",
        PromptPolicy::LlmAssisted => "llm_assisted",
    };
    axum::http::HeaderValue::from_static(name)
}

/// Derives the last user prompt text for the Activity preview ring (spec §4.2 step 9,
/// §3 "keyed by the last user prompt's normalized lowercase form").
fn last_user_message_content(body: &Value) -> String {
    body.get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.iter().rev().find(|m| m.get("role").and_then(Value::as_str) == Some("user")))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| body.get("input").and_then(Value::as_str).map(str::to_string))
        .or_else(|| body.get("prompt").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

/// Soft restart (spec §6 `POST /api/restart`): clears runtime overrides and the
/// activity ring without touching process state or config.
pub async fn soft_restart(state: &GatewayState) {
    state.maps.lock().await.clear_runtime_overrides();
    state.activity.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwconfig::{Filters, GlobalSettings};

    fn model(id: &str, aliases: Vec<&str>) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            name: None,
            description: None,
            cmd: "llama-server".to_string(),
            proxy_url: Some("http://127.0.0.1:9999".to_string()),
            check_endpoint: "/health".to_string(),
            ttl_seconds: 0,
            aliases: aliases.into_iter().map(str::to_string).collect(),
            filters: Filters::default(),
            truncation_mode: Default::default(),
            use_model_name: None,
            unlisted: false,
            ctx_size: None,
            prompt_policy: Default::default(),
            metadata: Default::default(),
        }
    }

    fn config_with(models: Vec<ModelDescriptor>) -> GatewayConfig {
        GatewayConfig {
            models,
            groups: vec![],
            peers: vec![],
            tools: vec![],
            tool_settings: ToolRuntimeSettings::default(),
            settings: GlobalSettings::default(),
        }
    }

    #[test]
    fn resolve_model_matches_by_alias() {
        let config = config_with(vec![model("coder", vec!["code"])]);
        let target = resolve_model(&config, Some("code"), EndpointKind::ChatCompletions, None, &[]).unwrap();
        assert!(matches!(target, ResolvedTarget::Local(m) if m.id == "coder"));
    }

    #[test]
    fn resolve_model_maps_localhost_to_fallback_for_responses() {
        let mut config = config_with(vec![model("coder", vec![])]);
        config.settings.fallback_model = Some("coder".to_string());
        let target = resolve_model(&config, Some("localhost"), EndpointKind::Responses, None, &[]).unwrap();
        assert!(matches!(target, ResolvedTarget::Local(m) if m.id == "coder"));
    }

    #[test]
    fn resolve_model_falls_back_to_first_ready_when_absent() {
        let config = config_with(vec![model("coder", vec![])]);
        let target = resolve_model(&config, None, EndpointKind::ChatCompletions, Some("coder"), &[]).unwrap();
        assert!(matches!(target, ResolvedTarget::Local(m) if m.id == "coder"));
    }

    #[test]
    fn resolve_model_falls_back_to_ollama_namespace() {
        let config = config_with(vec![]);
        let ollama_models = vec![crate::model::OllamaModel { id: "ollama/llama3".into(), name: "llama3".into(), ctx_reference: None }];
        let target = resolve_model(&config, Some("ollama/llama3"), EndpointKind::ChatCompletions, None, &ollama_models).unwrap();
        assert!(matches!(target, ResolvedTarget::Ollama(m) if m.name == "llama3"));
    }

    #[test]
    fn resolve_model_errors_when_nothing_matches() {
        let config = config_with(vec![]);
        let err = resolve_model(&config, Some("ghost"), EndpointKind::ChatCompletions, None, &[]).unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[test]
    fn apply_filters_strips_and_overwrites() {
        let mut m = model("coder", vec![]);
        m.filters.strip_params = vec!["logit_bias".to_string()];
        m.filters.set_params.insert("top_p".to_string(), serde_json::json!(0.9));
        m.use_model_name = Some("coder-7b".to_string());

        let body = serde_json::json!({"model": "coder", "logit_bias": {}, "top_p": 0.5});
        let out = apply_filters(body, &m);
        assert_eq!(out["model"], "coder-7b");
        assert!(out.get("logit_bias").is_none());
        assert_eq!(out["top_p"], 0.9);
    }

    #[test]
    fn decompress_body_passes_through_identity() {
        let body = Bytes::from_static(b"{}");
        let out = decompress_body(body.clone(), None).unwrap();
        assert_eq!(out, body);
    }

    #[test]
    fn decompress_body_rejects_unknown_encoding() {
        let err = decompress_body(Bytes::from_static(b"{}"), Some("br")).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }
}
