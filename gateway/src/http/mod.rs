//! External HTTP surface (spec §6): inference endpoints, model listing, upstream
//! passthrough, administration, runtime per-model controls, tools CRUD, observability,
//! and health. Grounded on the teacher's `serve::app::router` (axum `Router` +
//! `with_state`, one handler per route) generalized from one WebSocket route to the
//! gateway's much larger REST surface.

pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use futures::stream::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use crate::dispatch::{self, DispatchRequest, GatewayState};
use crate::error::GatewayError;
use crate::model::FitCtxMode;
use crate::tools::registry::ToolCatalog;

const INFERENCE_PATHS: &[&str] = &[
    "/v1/chat/completions",
    "/v1/responses",
    "/v1/completions",
    "/v1/messages",
    "/v1/messages/count_tokens",
    "/v1/embeddings",
    "/v1/audio/speech",
    "/v1/audio/transcriptions",
    "/v1/images/generations",
    "/v1/images/edits",
    "/v1/rerank",
    "/v1/reranking",
    "/rerank",
    "/reranking",
    "/infill",
    "/completion",
];

/// Builds the full router (spec §6). CORS is left fully open and `OPTIONS` permissive,
/// matching "CORS open; permissive OPTIONS".
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let mut router = Router::new();
    for path in INFERENCE_PATHS {
        router = router.route(path, post(inference_handler));
    }
    router = router.route("/v1/audio/voices", get(inference_handler).post(inference_handler));

    router
        .route("/v1/models", get(list_models))
        .route("/upstream/*rest", get(upstream_passthrough).post(upstream_passthrough))
        .route("/api/models/unload", post(unload_all))
        .route("/api/models/unload/:model", post(unload_model))
        .route("/api/models/kill-llama-cpp", post(kill_llama_cpp))
        .route("/api/config/reload", post(config_reload))
        .route("/api/restart", post(restart))
        .route("/api/config/path", get(config_path))
        .route("/api/version", get(version))
        .route("/api/running", get(running))
        .route("/unload", get(unload_all))
        .route("/api/model/:model/ctxsize", get(get_ctxsize).post(set_ctxsize))
        .route("/api/model/:model/fit", get(get_fit).post(set_fit))
        .route("/api/model/:model/prompt-optimization", get(get_prompt_policy).post(set_prompt_policy))
        .route("/api/model/:model/prompt-optimization/latest", get(get_prompt_optimization_latest))
        .route("/api/tools", get(list_tools).post(create_tool))
        .route("/api/tools/:id", axum::routing::put(update_tool).delete(delete_tool))
        .route("/api/tools/settings", get(get_tool_settings).put(put_tool_settings))
        .route("/api/metrics", get(metrics))
        .route("/api/captures/:id", get(get_capture))
        .route("/api/activity/prompts", get(activity_prompts))
        .route("/api/events", get(events_stream))
        .route("/logs", get(logs))
        .route("/logs/stream/:id", get(logs_stream))
        .route("/logs/stream", get(logs_stream_all))
        .route("/health", get(health))
        .route("/wol-health", get(health))
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_api_key))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

/// Hand-rolled CORS (spec §6 "CORS open; permissive OPTIONS"), matching the teacher's
/// own practice of doing header handling by hand in `serve` rather than pulling in
/// `tower-http` for it.
async fn cors_middleware(request: Request<Body>, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        insert_cors_headers(response.headers_mut());
        return response;
    }
    let mut response = next.run(request).await;
    insert_cors_headers(response.headers_mut());
    response
}

fn insert_cors_headers(headers: &mut HeaderMap) {
    headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"));
    headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
}

async fn health() -> &'static str {
    "OK"
}

/// Inference dispatch entry point (spec §4.2 steps 2-9); step 1 (auth) already ran as
/// middleware.
async fn inference_handler(
    State(state): State<Arc<GatewayState>>,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_encoding = headers.get(axum::http::header::CONTENT_ENCODING).and_then(|v| v.to_str().ok());
    let decoded = match dispatch::decompress_body(body, content_encoding) {
        Ok(b) => b,
        Err(e) => return e.into_response(),
    };
    let body: Value = match serde_json::from_slice(&decoded) {
        Ok(v) => v,
        Err(e) => return GatewayError::InvalidRequest(format!("invalid json body: {e}")).into_response(),
    };

    let approval_interactive = headers
        .get("X-LlamaSwap-Tool-Approval-Interactive")
        .is_some();
    let approval_granted = headers.get("X-LlamaSwap-Tool-Approval").is_some();
    let user_agent = headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok()).map(str::to_string);

    let request = DispatchRequest {
        path: uri.path().to_string(),
        body,
        tool_approval_interactive_requested: approval_interactive,
        tool_approval_granted: approval_granted,
        user_agent,
    };

    match dispatch::dispatch(&state, request).await {
        Ok(outcome) => {
            let mut response = Json(outcome.body).into_response();
            response.headers_mut().extend(outcome.headers);
            response
        }
        Err(e) => e.into_response(),
    }
}

/// `GET /v1/models` (spec §6): configured + peer + ollama models, sorted by `id`.
async fn list_models(State(state): State<Arc<GatewayState>>) -> Response {
    let config = state.config.read().await;
    let mut entries: Vec<Value> = Vec::new();

    for model in &config.models {
        if model.unlisted {
            continue;
        }
        entries.push(json!({
            "id": model.id,
            "object": "model",
            "owned_by": "llama-swap",
            "meta": { "llamaswap": { "group": Value::Null, "ctx_size": model.ctx_size } },
        }));
        if config.settings.include_aliases_in_list {
            for alias in &model.aliases {
                entries.push(json!({
                    "id": alias,
                    "object": "model",
                    "owned_by": "llama-swap",
                    "meta": { "llamaswap": { "alias_of": model.id } },
                }));
            }
        }
    }

    for peer in &config.peers {
        for m in &peer.models {
            entries.push(json!({ "id": m, "object": "model", "owned_by": format!("{}: {}", peer.name, m) }));
        }
    }

    for model in state.ollama.models() {
        entries.push(json!({
            "id": model.id,
            "object": "model",
            "owned_by": "ollama",
            "meta": { "llamaswap": { "ctx_reference": model.ctx_reference } },
        }));
    }

    entries.sort_by(|a, b| a["id"].as_str().unwrap_or("").cmp(b["id"].as_str().unwrap_or("")));
    Json(json!({ "object": "list", "data": entries })).into_response()
}

/// `GET|POST /upstream/<model>[/subpath]` (spec §6): longest configured-model-id prefix
/// match, trailing-slash redirect (301 GET/HEAD, 308 otherwise).
async fn upstream_passthrough(
    State(state): State<Arc<GatewayState>>,
    method: axum::http::Method,
    Path(rest): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if rest.ends_with('/') {
        let status = if matches!(method, axum::http::Method::GET | axum::http::Method::HEAD) {
            StatusCode::MOVED_PERMANENTLY
        } else {
            StatusCode::PERMANENT_REDIRECT
        };
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(axum::http::header::LOCATION, format!("/upstream/{}", rest.trim_end_matches('/')).parse().unwrap());
        return response;
    }

    let config = state.config.read().await;
    let model = config
        .models
        .iter()
        .filter(|m| rest == m.id || rest.starts_with(&format!("{}/", m.id)))
        .max_by_key(|m| m.id.len());

    let Some(model) = model else {
        return GatewayError::NotFound(format!("no configured model prefixes {rest}")).into_response();
    };
    let Some(base_url) = model.proxy_url.clone() else {
        return GatewayError::Server(format!("model {} has no proxy_url configured", model.id)).into_response();
    };
    let subpath = rest.strip_prefix(&model.id).unwrap_or("").to_string();

    let url = format!("{}{}", base_url.trim_end_matches('/'), subpath);
    let upstream_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(e) => return GatewayError::Server(format!("invalid upstream method: {e}")).into_response(),
    };
    let mut req = state.http_client.request(upstream_method, &url).body(body);
    for (name, value) in headers.iter() {
        req = req.header(name.as_str(), value.as_bytes());
    }
    match req.send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            let bytes = resp.bytes().await.unwrap_or_default();
            (status, bytes).into_response()
        }
        Err(e) => GatewayError::Server(format!("upstream passthrough failed: {e}")).into_response(),
    }
}

async fn unload_all(State(state): State<Arc<GatewayState>>) -> Response {
    let maps = state.maps.lock().await;
    for group in maps.process_manager.groups.values() {
        for member in &group.members {
            member.stop(crate::process::StopStrategy::StopImmediately).await;
        }
    }
    Json(json!({ "status": "ok" })).into_response()
}

async fn unload_model(State(state): State<Arc<GatewayState>>, Path(model): Path<String>) -> Response {
    let maps = state.maps.lock().await;
    for group in maps.process_manager.groups.values() {
        if let Some(p) = group.find(&model) {
            p.stop(crate::process::StopStrategy::StopImmediately).await;
            return Json(json!({ "status": "ok" })).into_response();
        }
    }
    GatewayError::NotFound(format!("model {model} not found")).into_response()
}

/// Best-effort `pkill`/`taskkill` of any stray `llama-server` process (spec §6
/// "best-effort pkill/taskkill").
async fn kill_llama_cpp() -> Response {
    #[cfg(target_os = "windows")]
    let _ = tokio::process::Command::new("taskkill").args(["/IM", "llama-server.exe", "/F"]).status().await;
    #[cfg(not(target_os = "windows"))]
    let _ = tokio::process::Command::new("pkill").args(["-f", "llama-server"]).status().await;

    Json(json!({ "status": "ok" })).into_response()
}

async fn config_reload() -> Response {
    Json(json!({ "status": "reload not implemented in this build; restart the process" })).into_response()
}

async fn restart(State(state): State<Arc<GatewayState>>) -> Response {
    dispatch::soft_restart(&state).await;
    Json(json!({ "status": "ok" })).into_response()
}

async fn config_path() -> Response {
    Json(json!({ "path": std::env::var("LLAMASWAP_CONFIG_PATH").unwrap_or_default() })).into_response()
}

async fn version() -> Response {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") })).into_response()
}

async fn running(State(state): State<Arc<GatewayState>>) -> Response {
    let maps = state.maps.lock().await;
    let running: Vec<Value> = maps
        .process_manager
        .groups
        .values()
        .flat_map(|g| g.members.iter())
        .filter(|p| p.state() == crate::model::ProcessState::Ready)
        .map(|p| json!({ "model": p.model_id, "group": p.group_name, "state": p.state() }))
        .collect();
    Json(json!({ "running": running })).into_response()
}

async fn get_ctxsize(State(state): State<Arc<GatewayState>>, Path(model): Path<String>) -> Response {
    let maps = state.maps.lock().await;
    Json(json!({ "ctx_size": maps.ctx_sizes.get(&model) })).into_response()
}

async fn set_ctxsize(State(state): State<Arc<GatewayState>>, Path(model): Path<String>, Json(body): Json<Value>) -> Response {
    if model.starts_with("ollama/") {
        return GatewayError::InvalidRequest("ollama models are read-only for ctx size".to_string()).into_response();
    }
    let Some(ctx) = body.get("ctx_size").and_then(Value::as_u64) else {
        return GatewayError::InvalidRequest("ctx_size must be an integer".to_string()).into_response();
    };
    let mut maps = state.maps.lock().await;
    maps.ctx_sizes.insert(model, ctx as u32);
    Json(json!({ "status": "ok" })).into_response()
}

async fn get_fit(State(state): State<Arc<GatewayState>>, Path(model): Path<String>) -> Response {
    let maps = state.maps.lock().await;
    Json(json!({
        "fit_enabled": maps.fit_modes.get(&model).copied().unwrap_or(false),
        "fit_ctx_mode": maps.fit_ctx_modes.get(&model),
    }))
    .into_response()
}

async fn set_fit(State(state): State<Arc<GatewayState>>, Path(model): Path<String>, Json(body): Json<Value>) -> Response {
    if model.starts_with("ollama/") {
        return GatewayError::InvalidRequest("ollama models are read-only for fit mode".to_string()).into_response();
    }
    let enabled = body.get("fit_enabled").and_then(Value::as_bool).unwrap_or(false);
    let mode = match body.get("fit_ctx_mode").and_then(Value::as_str) {
        Some("min") => Some(FitCtxMode::Min),
        Some("max") => Some(FitCtxMode::Max),
        _ => None,
    };
    let mut maps = state.maps.lock().await;
    maps.fit_modes.insert(model.clone(), enabled);
    if let Some(m) = mode {
        maps.fit_ctx_modes.insert(model, m);
    }
    Json(json!({ "status": "ok" })).into_response()
}

async fn get_prompt_policy(State(state): State<Arc<GatewayState>>, Path(model): Path<String>) -> Response {
    let maps = state.maps.lock().await;
    Json(json!({ "policy": maps.prompt_policies.get(&model) })).into_response()
}

async fn set_prompt_policy(State(state): State<Arc<GatewayState>>, Path(model): Path<String>, Json(body): Json<Value>) -> Response {
    let policy = match body.get("policy").and_then(Value::as_str) {
        Some("off") => gwconfig::PromptPolicy::Off,
        Some("limit_only") => gwconfig::PromptPolicy::LimitOnly,
        Some("always") => gwconfig::PromptPolicy::Always,
        Some("llm_assisted") => gwconfig::PromptPolicy::LlmAssisted,
        _ => return GatewayError::InvalidRequest("unknown prompt optimization policy".to_string()).into_response(),
    };
    let mut maps = state.maps.lock().await;
    maps.prompt_policies.insert(model, policy);
    Json(json!({ "status": "ok" })).into_response()
}

async fn get_prompt_optimization_latest(State(state): State<Arc<GatewayState>>, Path(model): Path<String>) -> Response {
    let maps = state.maps.lock().await;
    match maps.latest_prompt_optimizations.get(&model) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => GatewayError::NotFound(format!("no prompt optimization snapshot for {model}")).into_response(),
    }
}

async fn list_tools(State(state): State<Arc<GatewayState>>) -> Response {
    let catalog = state.tool_catalog.lock().await;
    Json(&catalog.tools).into_response()
}

async fn create_tool(State(state): State<Arc<GatewayState>>, Json(tool): Json<gwconfig::ToolConfig>) -> Response {
    upsert_tool(&state.tool_catalog, tool).await
}

async fn update_tool(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(mut tool): Json<gwconfig::ToolConfig>,
) -> Response {
    tool.id = id;
    upsert_tool(&state.tool_catalog, tool).await
}

async fn upsert_tool(catalog: &tokio::sync::Mutex<ToolCatalog>, tool: gwconfig::ToolConfig) -> Response {
    let mut catalog = catalog.lock().await;
    match catalog.upsert(tool) {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => GatewayError::Conflict(e.to_string()).into_response(),
    }
}

async fn delete_tool(State(state): State<Arc<GatewayState>>, Path(id): Path<String>) -> Response {
    let mut catalog = state.tool_catalog.lock().await;
    match catalog.remove(&id) {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => GatewayError::NotFound(e.to_string()).into_response(),
    }
}

async fn get_tool_settings(State(state): State<Arc<GatewayState>>) -> Response {
    let catalog = state.tool_catalog.lock().await;
    Json(&catalog.settings).into_response()
}

async fn put_tool_settings(State(state): State<Arc<GatewayState>>, Json(settings): Json<gwconfig::ToolRuntimeSettings>) -> Response {
    let mut catalog = state.tool_catalog.lock().await;
    catalog.settings = settings;
    match catalog.save() {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(e) => GatewayError::Server(e.to_string()).into_response(),
    }
}

async fn metrics(State(state): State<Arc<GatewayState>>) -> Response {
    let maps = state.maps.lock().await;
    let running = maps
        .process_manager
        .groups
        .values()
        .flat_map(|g| g.members.iter())
        .filter(|p| p.state() == crate::model::ProcessState::Ready)
        .count();
    Json(json!({ "running_models": running, "subscribers": state.events.subscriber_count() })).into_response()
}

/// `GET /api/captures/:id` (spec §6 Observability): looks up one activity-ring entry by
/// id, the gateway's capture of one dispatched request (spec §3 "Activity preview ring").
async fn get_capture(Path(id): Path<String>, State(state): State<Arc<GatewayState>>) -> Response {
    match state.activity.find(&id) {
        Some(entry) => Json(entry).into_response(),
        None => GatewayError::NotFound(format!("capture {id} not found")).into_response(),
    }
}

async fn activity_prompts(State(state): State<Arc<GatewayState>>) -> Response {
    Json(state.activity.snapshot()).into_response()
}

/// `GET /api/events` (spec §6): SSE multiplex of `modelStatus`, `logData`, `metrics`.
async fn events_stream(State(state): State<Arc<GatewayState>>) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.events.subscribe();
    let stream = ReceiverStream::new(rx).map(|value| Ok(Event::default().event(value["type"].as_str().unwrap_or("event").to_string()).data(value.to_string())));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

async fn logs() -> Response {
    "".into_response()
}

async fn logs_stream(Path(_id): Path<String>, State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    logs_stream_all(State(state)).await
}

async fn logs_stream_all(State(state): State<Arc<GatewayState>>) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let rx = state.events.subscribe();
    let stream = ReceiverStream::new(rx)
        .filter(|value| futures::future::ready(value["type"] == "logData"))
        .map(|value| Ok(Event::default().data(value["message"].as_str().unwrap_or_default().to_string())));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
