//! Tool Loop (spec §4.7): drives up to `maxToolRounds` rounds of assistant turns,
//! executing tool calls and re-invoking the upstream; supports approval-gated
//! interactive mode and watchdog tag-embedded tool-call detection.

use async_trait::async_trait;
use gwconfig::{ToolConfig, ToolKind, ToolPolicy, ToolRuntimeSettings, WatchdogMode, WebSearchMode};
use regex::Regex;
use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{GatewayError, PendingToolCall};
use crate::tools::{http_tool, mcp::McpSession, ToolCallOutcome, ToolError};

/// Keyword list for `webSearchMode = force` (spec §4.7 step 1).
const FORCE_SEARCH_KEYWORDS: &[&str] = &["search", "web", "latest", "today", "news", "docs", "release notes"];

/// One inference call against the resolved backend (local process or ollama). The Tool
/// Loop is agnostic to which forwarder produced it (spec §9 "Dynamic dispatch").
#[async_trait]
pub trait InnerHandler: Send + Sync {
    async fn invoke(&self, request: Value) -> Result<Value, GatewayError>;
}

/// Header carrying interactive tool-approval grants (spec §4.7 step 4a, §7).
pub const DEFAULT_APPROVAL_HEADER: &str = "X-LlamaSwap-Tool-Approval";

/// Watchdog tag regex: `<tool_call>{...json...}</tool_call>` (spec glossary "Watchdog tool").
fn watchdog_regex() -> Regex {
    Regex::new(r"(?s)<tool_call>\s*(\{.*?\})\s*</tool_call>").expect("valid regex")
}

fn tool_json_schema(tool: &ToolConfig) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description.clone().unwrap_or_default(),
            "parameters": {
                "type": "object",
                "properties": { "query": { "type": "string" } },
            }
        }
    })
}

/// Merges tool schemas into `request.tools[]`, de-duplicated by function name
/// (spec §4.7 step 1).
fn inject_tool_schemas(request: &mut Value, tools: &[ToolConfig]) {
    let mut existing: Vec<Value> = request.get("tools").and_then(Value::as_array).cloned().unwrap_or_default();
    let existing_names: std::collections::HashSet<String> = existing
        .iter()
        .filter_map(|t| t.get("function").and_then(|f| f.get("name")).and_then(Value::as_str))
        .map(str::to_string)
        .collect();

    for tool in tools.iter().filter(|t| t.enabled) {
        if !existing_names.contains(&tool.name) {
            existing.push(tool_json_schema(tool));
        }
    }

    if let Some(obj) = request.as_object_mut() {
        obj.insert("tools".to_string(), Value::Array(existing));
    }
}

/// Forces `tool_choice` when any enabled tool has policy `always`, or when
/// `webSearchMode=force` and the last user text matches a search keyword and exactly
/// one HTTP search-like tool is eligible (spec §4.7 step 1).
fn force_tool_choice(request: &mut Value, tools: &[ToolConfig], web_search_mode: WebSearchMode, last_user_text: &str) {
    if let Some(always) = tools.iter().find(|t| t.enabled && t.policy == ToolPolicy::Always) {
        set_tool_choice(request, &always.name);
        return;
    }

    if web_search_mode != WebSearchMode::Force {
        return;
    }
    let lower = last_user_text.to_lowercase();
    if !FORCE_SEARCH_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return;
    }

    let search_re = Regex::new(r"(?i)searxng|web_search|search").expect("valid regex");
    let http_tools: Vec<&ToolConfig> = tools.iter().filter(|t| t.enabled && t.kind == ToolKind::Http).collect();
    let candidate = if http_tools.len() == 1 {
        Some(http_tools[0])
    } else {
        http_tools.iter().find(|t| search_re.is_match(&t.name)).copied()
    };
    if let Some(tool) = candidate {
        set_tool_choice(request, &tool.name);
    }
}

fn set_tool_choice(request: &mut Value, name: &str) {
    if let Some(obj) = request.as_object_mut() {
        obj.insert("tool_choice".to_string(), json!({ "type": "function", "function": { "name": name } }));
    }
}

fn set_tool_choice_none(request: &mut Value) {
    if let Some(obj) = request.as_object_mut() {
        obj.insert("tool_choice".to_string(), Value::String("none".to_string()));
    }
}

/// One tool call as surfaced by the upstream, normalized across structured `tool_calls`,
/// legacy `function_call`, and watchdog-tag forms.
struct DetectedCall {
    id: Option<String>,
    name: String,
    arguments: Value,
}

fn detect_calls(message: &Value, watchdog_allowed: bool) -> Vec<DetectedCall> {
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        return calls
            .iter()
            .map(|c| DetectedCall {
                id: c.get("id").and_then(Value::as_str).map(str::to_string),
                name: c.get("function").and_then(|f| f.get("name")).and_then(Value::as_str).unwrap_or_default().to_string(),
                arguments: parse_arguments(c.get("function").and_then(|f| f.get("arguments"))),
            })
            .collect();
    }

    if let Some(call) = message.get("function_call") {
        return vec![DetectedCall {
            id: None,
            name: call.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            arguments: parse_arguments(call.get("arguments")),
        }];
    }

    if watchdog_allowed {
        if let Some(content) = message.get("content").and_then(Value::as_str) {
            if let Some(caps) = watchdog_regex().captures(content) {
                if let Ok(parsed) = serde_json::from_str::<Value>(&caps[1]) {
                    let name = parsed.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
                    let arguments = parsed.get("arguments").cloned().unwrap_or(json!({}));
                    if !name.is_empty() {
                        return vec![DetectedCall { id: None, name, arguments }];
                    }
                }
            }
        }
    }

    Vec::new()
}

fn parse_arguments(value: Option<&Value>) -> Value {
    match value {
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(json!({})),
        Some(other) => other.clone(),
        None => json!({}),
    }
}

/// Dispatches one detected call to its HTTP or MCP endpoint, applying the
/// `blockNonLocalEndpoints` gate first (spec §4.7 step 4, §8 Safety).
async fn dispatch_call(
    client: &reqwest::Client,
    tool: &ToolConfig,
    call: &DetectedCall,
    settings: &ToolRuntimeSettings,
) -> Result<ToolCallOutcome, ToolError> {
    http_tool::validate_endpoint(&tool.endpoint, settings.block_non_local_endpoints, &[])?;

    let timeout = tool.timeout_seconds.map(Duration::from_secs);
    match tool.kind {
        ToolKind::Http => {
            http_tool::call(client, &tool.name, &tool.endpoint, call.arguments.clone(), timeout.unwrap_or(http_tool::DEFAULT_HTTP_TIMEOUT)).await
        }
        ToolKind::Mcp => {
            let session = McpSession::open(client.clone(), tool.endpoint.clone(), timeout.unwrap_or(mcp::DEFAULT_MCP_TIMEOUT)).await?;
            session
                .call_tool(tool.remote_name.as_deref(), call.arguments.clone(), timeout.unwrap_or(mcp::DEFAULT_MCP_TIMEOUT))
                .await
        }
    }
}

use crate::tools::mcp;

/// Parameters controlling one Tool Loop run.
pub struct ToolLoopParams<'a> {
    pub tools: &'a [ToolConfig],
    pub settings: &'a ToolRuntimeSettings,
    pub approval_interactive_requested: bool,
    pub approval_granted: bool,
    pub approval_header_name: String,
}

/// Runs the Tool Loop over `request` (a `chat/completions`-shaped body), bounded by
/// `settings.max_tool_rounds` (spec §4.7).
pub async fn run(
    client: &reqwest::Client,
    handler: &dyn InnerHandler,
    mut request: Value,
    params: &ToolLoopParams<'_>,
) -> Result<Value, GatewayError> {
    let watchdog_allowed = params.settings.watchdog_mode == WatchdogMode::Auto
        || params.tools.iter().any(|t| t.policy == ToolPolicy::Watchdog);

    let last_user_text = request
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|m| m.iter().rev().find(|msg| msg.get("role").and_then(Value::as_str) == Some("user")))
        .and_then(|msg| msg.get("content").and_then(Value::as_str))
        .unwrap_or_default()
        .to_string();

    inject_tool_schemas(&mut request, params.tools);
    force_tool_choice(&mut request, params.tools, params.settings.web_search_mode, &last_user_text);

    let mut messages: Vec<Value> = request.get("messages").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut collected_urls: Vec<String> = Vec::new();
    let max_rounds = params.settings.max_tool_rounds.max(1);

    for _round in 0..max_rounds {
        if let Some(obj) = request.as_object_mut() {
            obj.insert("messages".to_string(), Value::Array(messages.clone()));
            obj.insert("stream".to_string(), Value::Bool(false));
        }

        let response = handler.invoke(request.clone()).await?;
        let message = response
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .cloned()
            .unwrap_or(json!({}));

        let calls = detect_calls(&message, watchdog_allowed);
        if calls.is_empty() {
            return Ok(finalize(response, &collected_urls));
        }

        if params.approval_interactive_requested && !params.approval_granted {
            let pending = calls
                .iter()
                .map(|c| PendingToolCall {
                    id: c.id.clone().unwrap_or_default(),
                    name: c.name.clone(),
                    arguments: c.arguments.clone(),
                })
                .collect();
            return Err(GatewayError::ToolApprovalRequired {
                header_name: params.approval_header_name.clone(),
                tool_calls: pending,
            });
        }

        messages.push(message.clone());

        for call in &calls {
            let tool_config = params.tools.iter().find(|t| t.name == call.name || t.remote_name.as_deref() == Some(call.name.as_str()));
            let tool_message = match tool_config {
                None => json!({ "role": "tool", "tool_call_id": call.id, "content": format!("tool error: unknown tool {}", call.name) }),
                Some(tool) => match dispatch_call(client, tool, call, params.settings).await {
                    Ok(outcome) => {
                        collected_urls.extend(outcome.urls.clone());
                        json!({ "role": "tool", "tool_call_id": call.id, "content": outcome.text })
                    }
                    Err(e) => json!({ "role": "tool", "tool_call_id": call.id, "content": format!("tool error: {e}") }),
                },
            };
            messages.push(tool_message);
        }

        set_tool_choice_none(&mut request);
    }

    // Exhausted max_tool_rounds without a final answer: run one last pass with tools
    // disabled so the model is forced to produce a plain answer.
    if let Some(obj) = request.as_object_mut() {
        obj.insert("messages".to_string(), Value::Array(messages));
        obj.insert("tools".to_string(), Value::Array(Vec::new()));
    }
    let response = handler.invoke(request).await?;
    Ok(finalize(response, &collected_urls))
}

/// Harvests collected URLs into `choices[0].message.sources`, deduplicated and sorted
/// lexicographically by URL (spec §4.7 step 6, §8 Testable Properties).
fn finalize(mut response: Value, urls: &[String]) -> Value {
    if urls.is_empty() {
        return response;
    }
    let mut unique: Vec<String> = urls.to_vec();
    unique.sort();
    unique.dedup();

    if let Some(message) = response
        .get_mut("choices")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.get_mut("message"))
        .and_then(Value::as_object_mut)
    {
        message.insert("sources".to_string(), json!(unique));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tool(name: &str, policy: ToolPolicy) -> ToolConfig {
        ToolConfig {
            id: name.to_string(),
            name: name.to_string(),
            kind: ToolKind::Http,
            endpoint: "http://127.0.0.1:1/search?q={query}".to_string(),
            enabled: true,
            description: None,
            remote_name: None,
            policy,
            require_approval: false,
            timeout_seconds: None,
        }
    }

    #[test]
    fn inject_tool_schemas_dedupes_by_function_name() {
        let mut request = json!({ "tools": [{"type":"function","function":{"name":"searxng_web_search"}}] });
        let tools = vec![sample_tool("searxng_web_search", ToolPolicy::Auto), sample_tool("other_tool", ToolPolicy::Auto)];
        inject_tool_schemas(&mut request, &tools);
        let names: Vec<&str> = request["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["function"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["searxng_web_search", "other_tool"]);
    }

    #[test]
    fn force_tool_choice_applies_for_always_policy_tool() {
        let mut request = json!({});
        let tools = vec![sample_tool("must_run", ToolPolicy::Always)];
        force_tool_choice(&mut request, &tools, WebSearchMode::Off, "hello");
        assert_eq!(request["tool_choice"]["function"]["name"], "must_run");
    }

    #[test]
    fn force_tool_choice_applies_for_force_web_search_with_keyword_match() {
        let mut request = json!({});
        let tools = vec![sample_tool("searxng_web_search", ToolPolicy::Auto)];
        force_tool_choice(&mut request, &tools, WebSearchMode::Force, "what's the latest news today");
        assert_eq!(request["tool_choice"]["function"]["name"], "searxng_web_search");
    }

    #[test]
    fn detect_calls_reads_structured_tool_calls() {
        let message = json!({ "tool_calls": [{"id": "call_1", "function": {"name": "t", "arguments": "{\"q\":\"x\"}"}}] });
        let calls = detect_calls(&message, false);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "t");
        assert_eq!(calls[0].arguments["q"], "x");
    }

    #[test]
    fn detect_calls_parses_watchdog_tag_when_allowed() {
        let message = json!({ "content": "preamble <tool_call>{\"name\":\"t\",\"arguments\":{\"q\":\"x\"}}</tool_call> trailing" });
        let calls = detect_calls(&message, true);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "t");
    }

    #[test]
    fn detect_calls_ignores_watchdog_tag_when_not_allowed() {
        let message = json!({ "content": "<tool_call>{\"name\":\"t\",\"arguments\":{}}</tool_call>" });
        assert!(detect_calls(&message, false).is_empty());
    }

    #[test]
    fn finalize_dedupes_and_sorts_sources() {
        let response = json!({ "choices": [{"message": {"content": "hi"}}] });
        let urls = vec!["http://b".to_string(), "http://a".to_string(), "http://a".to_string()];
        let out = finalize(response, &urls);
        assert_eq!(out["choices"][0]["message"]["sources"], json!(["http://a", "http://b"]));
    }

    struct FixedHandler(Value);

    #[async_trait]
    impl InnerHandler for FixedHandler {
        async fn invoke(&self, _request: Value) -> Result<Value, GatewayError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn run_returns_final_answer_when_no_tool_calls() {
        let client = reqwest::Client::new();
        let handler = FixedHandler(json!({ "choices": [{"message": {"role":"assistant","content":"done"}}] }));
        let request = json!({ "messages": [{"role":"user","content":"hi"}] });
        let settings = ToolRuntimeSettings::default();
        let params = ToolLoopParams {
            tools: &[],
            settings: &settings,
            approval_interactive_requested: false,
            approval_granted: false,
            approval_header_name: DEFAULT_APPROVAL_HEADER.to_string(),
        };
        let out = run(&client, &handler, request, &params).await.unwrap();
        assert_eq!(out["choices"][0]["message"]["content"], "done");
    }

    #[tokio::test]
    async fn run_requires_approval_when_interactive_and_not_granted() {
        let client = reqwest::Client::new();
        let handler = FixedHandler(json!({
            "choices": [{"message": {"role":"assistant","tool_calls":[{"id":"call_1","function":{"name":"searxng_web_search","arguments":"{}"}}]}}]
        }));
        let request = json!({ "messages": [{"role":"user","content":"search something"}] });
        let tools = vec![sample_tool("searxng_web_search", ToolPolicy::Auto)];
        let settings = ToolRuntimeSettings { require_approval_header: true, ..Default::default() };
        let params = ToolLoopParams {
            tools: &tools,
            settings: &settings,
            approval_interactive_requested: true,
            approval_granted: false,
            approval_header_name: DEFAULT_APPROVAL_HEADER.to_string(),
        };
        let err = run(&client, &handler, request, &params).await.unwrap_err();
        match err {
            GatewayError::ToolApprovalRequired { header_name, tool_calls } => {
                assert_eq!(header_name, DEFAULT_APPROVAL_HEADER);
                assert_eq!(tool_calls[0].name, "searxng_web_search");
            }
            _ => panic!("expected ToolApprovalRequired"),
        }
    }
}
