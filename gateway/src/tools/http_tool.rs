//! HTTP tool transport (spec §4.7 step 4 "HTTP"): templated GET with argument
//! normalization, plus searxng-specific result summarization.

use std::net::ToSocketAddrs;
use std::time::Duration;

use reqwest::Url;
use serde_json::Value;

use super::{derive_query, unwrap_arguments, ToolCallOutcome, ToolError};

/// Default HTTP tool timeout (spec §4.7 "Timeouts default to 20 s (HTTP)").
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(20);

/// Validates a tool endpoint against the `blockNonLocalEndpoints` policy (spec §3 Tool
/// invariant, §8 "Safety" testable property): when enabled, the host must resolve to
/// loopback, a `.local` name, or a configured docker-host alias.
pub fn validate_endpoint(endpoint: &str, block_non_local: bool, docker_host_aliases: &[String]) -> Result<(), ToolError> {
    let url = Url::parse(endpoint).map_err(|e| ToolError::Transport(format!("invalid endpoint url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ToolError::Transport(format!("unsupported endpoint scheme: {}", url.scheme())));
    }
    if !block_non_local {
        return Ok(());
    }
    let host = url.host_str().ok_or_else(|| ToolError::Transport("endpoint has no host".to_string()))?;
    if host.ends_with(".local") || docker_host_aliases.iter().any(|a| a == host) {
        return Ok(());
    }
    if is_loopback_host(host) {
        return Ok(());
    }
    Err(ToolError::NonLocalEndpointBlocked)
}

fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return ip.is_loopback();
    }
    // Best-effort DNS resolution for named hosts; a lookup failure is treated as non-local
    // rather than panicking, so dispatch fails closed under blockNonLocalEndpoints.
    (host, 0u16)
        .to_socket_addrs()
        .map(|mut addrs| addrs.all(|a| a.ip().is_loopback()))
        .unwrap_or(false)
}

/// Substitutes `{query}` and `{name}` placeholders into the endpoint template,
/// URL-encoding both (spec §4.7).
fn substitute_placeholders(template: &str, query: Option<&str>, name: &str) -> String {
    let mut out = template.to_string();
    if let Some(q) = query {
        out = out.replace("{query}", &urlencoding::encode(q));
    }
    out = out.replace("{name}", &urlencoding::encode(name));
    out
}

/// Dispatches an HTTP tool call: normalizes arguments, substitutes the endpoint
/// template, issues the GET, and (for searxng-named tools) summarizes the first five
/// results into a bullet list (spec §4.7 step 4).
pub async fn call(
    client: &reqwest::Client,
    tool_name: &str,
    endpoint_template: &str,
    raw_arguments: Value,
    timeout: Duration,
) -> Result<ToolCallOutcome, ToolError> {
    let args = unwrap_arguments(&raw_arguments);
    let query = derive_query(&args);
    let url = substitute_placeholders(endpoint_template, query.as_deref(), tool_name);

    let resp = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ToolError::Transport(e.to_string()))?;

    if !resp.status().is_success() {
        return Err(ToolError::CallFailed(format!("http tool returned status {}", resp.status())));
    }

    let body: Value = resp.json().await.map_err(|e| ToolError::Transport(e.to_string()))?;

    if tool_name.to_lowercase().contains("searxng") {
        return Ok(summarize_searxng(&body));
    }

    Ok(ToolCallOutcome { text: body.to_string(), urls: extract_urls(&body) })
}

/// Summarizes the first five `results[]` entries into a bullet list of title/url/content
/// (spec §4.7 "For searxng-named tools, summarize the first five results[] ...").
fn summarize_searxng(body: &Value) -> ToolCallOutcome {
    let empty = Vec::new();
    let results = body.get("results").and_then(Value::as_array).unwrap_or(&empty);
    let mut lines = Vec::new();
    let mut urls = Vec::new();
    for r in results.iter().take(5) {
        let title = r.get("title").and_then(Value::as_str).unwrap_or("(untitled)");
        let url = r.get("url").and_then(Value::as_str).unwrap_or("");
        let content = r.get("content").and_then(Value::as_str).unwrap_or("");
        lines.push(format!("- {title} ({url}): {content}"));
        if !url.is_empty() {
            urls.push(url.to_string());
        }
    }
    ToolCallOutcome { text: lines.join("\n"), urls }
}

fn extract_urls(body: &Value) -> Vec<String> {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(body, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_endpoint_allows_loopback_when_blocked() {
        assert!(validate_endpoint("http://127.0.0.1:8080/search", true, &[]).is_ok());
        assert!(validate_endpoint("http://localhost:8080/search", true, &[]).is_ok());
    }

    #[test]
    fn validate_endpoint_rejects_remote_host_when_blocked() {
        let err = validate_endpoint("http://example.com/search", true, &[]).unwrap_err();
        assert!(matches!(err, ToolError::NonLocalEndpointBlocked));
    }

    #[test]
    fn validate_endpoint_allows_docker_host_alias() {
        assert!(validate_endpoint("http://host.docker.internal:8080", true, &["host.docker.internal".to_string()]).is_ok());
    }

    #[test]
    fn validate_endpoint_permissive_when_policy_disabled() {
        assert!(validate_endpoint("http://example.com/search", false, &[]).is_ok());
    }

    #[test]
    fn substitute_placeholders_url_encodes_query() {
        let out = substitute_placeholders("http://127.0.0.1/search?q={query}", Some("rust lang"), "searxng_web_search");
        assert_eq!(out, "http://127.0.0.1/search?q=rust%20lang");
    }

    #[test]
    fn summarize_searxng_takes_first_five_and_collects_urls() {
        let body = serde_json::json!({"results": [
            {"title": "a", "url": "http://x/1", "content": "c1"},
            {"title": "b", "url": "http://x/2", "content": "c2"},
        ]});
        let outcome = summarize_searxng(&body);
        assert_eq!(outcome.urls, vec!["http://x/1", "http://x/2"]);
        assert!(outcome.text.contains("a (http://x/1): c1"));
    }
}
