//! Ollama Adapter (spec §4.8): discovers a running ollama endpoint, enriches its model
//! list with a reference context length, and reverse-proxies inference traffic to it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use regex::Regex;
use serde_json::Value;

use crate::error::GatewayError;
use crate::model::OllamaModel;

/// Minimum interval between probe sweeps (spec §4.8 "respects a 10 s minimum interval").
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Adapter state: the last-discovered endpoint and its enriched model list, refreshed
/// on demand (spec §4.8).
pub struct OllamaAdapter {
    client: reqwest::Client,
    configured_endpoint: Option<String>,
    last_refresh: Mutex<Option<Instant>>,
    endpoint: Mutex<Option<String>>,
    models: Mutex<Vec<OllamaModel>>,
}

impl OllamaAdapter {
    pub fn new(client: reqwest::Client, configured_endpoint: Option<String>) -> Self {
        Self {
            client,
            configured_endpoint,
            last_refresh: Mutex::new(None),
            endpoint: Mutex::new(None),
            models: Mutex::new(Vec::new()),
        }
    }

    pub fn current_endpoint(&self) -> Option<String> {
        self.endpoint.lock().expect("ollama mutex poisoned").clone()
    }

    pub fn models(&self) -> Vec<OllamaModel> {
        self.models.lock().expect("ollama mutex poisoned").clone()
    }

    /// Re-probes for a live ollama endpoint and refreshes the model list, unless the
    /// last successful refresh was under 10 s ago and `force` is false.
    pub async fn refresh(&self, force: bool) -> Result<(), GatewayError> {
        {
            let last = self.last_refresh.lock().expect("ollama mutex poisoned");
            if !force {
                if let Some(t) = *last {
                    if t.elapsed() < MIN_REFRESH_INTERVAL {
                        return Ok(());
                    }
                }
            }
        }

        let candidates = candidate_endpoints(self.configured_endpoint.as_deref());
        for endpoint in candidates {
            match fetch_tags(&self.client, &endpoint).await {
                Ok(names) => {
                    let mut enriched = Vec::with_capacity(names.len());
                    for name in names {
                        let ctx_reference = fetch_context_length(&self.client, &endpoint, &name).await;
                        enriched.push(OllamaModel { id: OllamaModel::namespaced_id(&name), name, ctx_reference });
                    }
                    *self.endpoint.lock().expect("ollama mutex poisoned") = Some(endpoint);
                    *self.models.lock().expect("ollama mutex poisoned") = enriched;
                    *self.last_refresh.lock().expect("ollama mutex poisoned") = Some(Instant::now());
                    return Ok(());
                }
                Err(_) => continue,
            }
        }

        *self.last_refresh.lock().expect("ollama mutex poisoned") = Some(Instant::now());
        Ok(())
    }

    /// Streaming reverse-proxy to the chosen endpoint (spec §4.8), preserving method/
    /// headers/body and marking SSE responses with `X-Accel-Buffering: no`.
    pub async fn proxy(
        &self,
        path: &str,
        method: Method,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response, GatewayError> {
        let endpoint = self
            .current_endpoint()
            .ok_or_else(|| GatewayError::NotFound("no ollama endpoint available".to_string()))?;
        headers.remove(axum::http::header::HOST);

        let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
        let upstream_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .map_err(|e| GatewayError::Server(format!("invalid proxy method: {e}")))?;

        let mut req = self.client.request(upstream_method, &url).body(body);
        for (name, value) in headers.iter() {
            req = req.header(name.as_str(), value.as_bytes());
        }

        let upstream = req.send().await.map_err(|e| GatewayError::Server(format!("ollama proxy error: {e}")))?;
        let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let content_type = upstream.headers().get(reqwest::header::CONTENT_TYPE).cloned();
        let is_sse = content_type
            .as_ref()
            .and_then(|v| v.to_str().ok())
            .map(|s| s.contains("text/event-stream"))
            .unwrap_or(false);

        let stream = upstream.bytes_stream();
        let mut response = Response::builder().status(status);
        if let Some(ct) = content_type {
            if let Ok(value) = HeaderValue::from_bytes(ct.as_bytes()) {
                response = response.header(HeaderName::from_static("content-type"), value);
            }
        }
        if is_sse {
            response = response.header("X-Accel-Buffering", "no");
        }

        response
            .body(Body::from_stream(stream))
            .map_err(|e| GatewayError::Server(format!("ollama proxy response build: {e}")))
    }
}

/// Ordered candidate endpoint list (spec §4.8): configured value, then
/// `LLAMASWAP_OLLAMA_ENDPOINT`, then `OLLAMA_HOST`, then a Linux `/etc/resolv.conf`
/// nameserver guess.
fn candidate_endpoints(configured: Option<&str>) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(c) = configured {
        out.push(normalize_endpoint(c));
    }
    if let Ok(v) = std::env::var("LLAMASWAP_OLLAMA_ENDPOINT") {
        out.push(normalize_endpoint(&v));
    }
    if let Ok(v) = std::env::var("OLLAMA_HOST") {
        out.push(normalize_endpoint(&v));
    }
    if let Some(ns) = resolv_conf_nameserver() {
        out.push(format!("http://{ns}:11434"));
    }
    out.dedup();
    out
}

fn normalize_endpoint(raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", raw.trim_end_matches('/'))
    }
}

#[cfg(target_os = "linux")]
fn resolv_conf_nameserver() -> Option<String> {
    let contents = std::fs::read_to_string("/etc/resolv.conf").ok()?;
    parse_resolv_conf_nameserver(&contents)
}

#[cfg(not(target_os = "linux"))]
fn resolv_conf_nameserver() -> Option<String> {
    None
}

fn parse_resolv_conf_nameserver(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("nameserver").map(str::trim).map(str::to_string))
}

async fn fetch_tags(client: &reqwest::Client, endpoint: &str) -> Result<Vec<String>, reqwest::Error> {
    let url = format!("{endpoint}/api/tags");
    let resp = client.get(&url).timeout(PROBE_TIMEOUT).send().await?.error_for_status()?;
    let body: Value = resp.json().await?;
    let names = body
        .get("models")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(Value::as_str).map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(names)
}

/// Fetches `/api/show` for one model and extracts a reference context length from
/// `model_info.*context_length|num_ctx`, falling back to a `PARAMETER num_ctx` line in
/// the modelfile text (spec §4.8).
async fn fetch_context_length(client: &reqwest::Client, endpoint: &str, model_name: &str) -> Option<u32> {
    let url = format!("{endpoint}/api/show");
    let resp = client
        .post(&url)
        .timeout(PROBE_TIMEOUT)
        .json(&serde_json::json!({ "name": model_name }))
        .send()
        .await
        .ok()?
        .error_for_status()
        .ok()?;
    let body: Value = resp.json().await.ok()?;
    extract_context_length(&body)
}

fn extract_context_length(show_response: &Value) -> Option<u32> {
    if let Some(info) = show_response.get("model_info").and_then(Value::as_object) {
        for (key, value) in info {
            if (key.contains("context_length") || key.ends_with("num_ctx")) && value.is_u64() {
                return value.as_u64().map(|v| v as u32);
            }
        }
    }
    let modelfile = show_response.get("modelfile").and_then(Value::as_str)?;
    let re = Regex::new(r"(?i)PARAMETER\s+num_ctx\s+(\d+)").ok()?;
    re.captures(modelfile)?.get(1)?.as_str().parse().ok()
}
