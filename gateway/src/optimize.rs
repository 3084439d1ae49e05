//! Prompt Optimizer (spec §4.5): per-model policy state machine selecting a Context
//! Manager strategy, with an `llm_assisted` summarization path and a snapshot recorded
//! after every pass.

use chrono::Utc;
use gwconfig::{PromptPolicy, TruncationMode};
use serde_json::Value;

use crate::context::{self, ChatMessage, ContextParams};
use crate::model::{cap_snapshot_body, PromptSnapshot};

const SUMMARIZATION_SYSTEM_PROMPT: &str =
    "You are a context compaction assistant. Summarize the following conversation \
     turns concisely, preserving facts, decisions, and open tasks relevant to what \
     comes next. Respond with prose only, no preamble.";

/// Outcome of running the optimizer over one request body.
pub struct OptimizeOutcome {
    pub body: Value,
    pub snapshot: PromptSnapshot,
}

fn extract_messages(body: &Value) -> Vec<ChatMessage> {
    body.get("messages")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .map(|m| ChatMessage {
                    role: m.get("role").and_then(Value::as_str).unwrap_or("user").to_string(),
                    content: m
                        .get("content")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn messages_to_json(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
        .collect()
}

fn with_messages(mut body: Value, messages: &[ChatMessage]) -> Value {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("messages".to_string(), Value::Array(messages_to_json(messages)));
    }
    body
}

/// Runs the configured policy against one request body, returning the (possibly
/// rewritten) body and a snapshot to persist (spec §4.5).
pub async fn apply(
    client: &reqwest::Client,
    upstream_base: &str,
    policy: PromptPolicy,
    ctx_size: u32,
    safety_margin: u32,
    truncation_mode: TruncationMode,
    body: Value,
) -> OptimizeOutcome {
    let original_body = body.to_string();
    let max_tokens = body.get("max_tokens").and_then(Value::as_i64).unwrap_or(0);
    let tools = body.get("tools").cloned();

    let (new_body, applied, note) = match policy {
        PromptPolicy::Off => (body, false, String::new()),
        PromptPolicy::LimitOnly => {
            let messages = extract_messages(&body);
            let params = ContextParams { ctx_size, safety_margin, truncation_mode };
            match context::crop(client, upstream_base, &params, &messages, tools.as_ref(), max_tokens).await {
                Ok(outcome) => {
                    let changed = outcome.messages.len() != messages.len();
                    (with_messages(body, &outcome.messages), changed, String::new())
                }
                Err(_) => (body, false, "crop failed, passed through unchanged".to_string()),
            }
        }
        PromptPolicy::Always => {
            let messages = extract_messages(&body);
            let compacted = context::low_vram_compact(&messages);
            let params = ContextParams { ctx_size, safety_margin, truncation_mode };
            let final_messages = if ctx_size > 0 {
                match context::crop(client, upstream_base, &params, &compacted, tools.as_ref(), max_tokens).await {
                    Ok(outcome) => outcome.messages,
                    Err(_) => compacted,
                }
            } else {
                compacted
            };
            let changed = final_messages.len() != messages.len()
                || final_messages.iter().zip(messages.iter()).any(|(a, b)| a.content != b.content);
            (with_messages(body, &final_messages), changed, String::new())
        }
        PromptPolicy::LlmAssisted => {
            let messages = extract_messages(&body);
            if messages.len() < 4 {
                (body, false, "fewer than 4 messages, llm_assisted skipped".to_string())
            } else {
                match summarize_middle_window(client, upstream_base, &messages).await {
                    Ok(summarized) => (with_messages(body, &summarized), true, String::new()),
                    Err(e) => {
                        let compacted = context::low_vram_compact(&messages);
                        (
                            with_messages(body, &compacted),
                            true,
                            format!("llm_assisted summarization failed ({e}), fell back to low-VRAM compaction"),
                        )
                    }
                }
            }
        }
    };

    let optimized_body_str = new_body.to_string();
    let snapshot = PromptSnapshot {
        policy,
        applied,
        updated_at: Utc::now(),
        note,
        original_body: cap_snapshot_body(&original_body),
        optimized_body: cap_snapshot_body(&optimized_body_str),
    };

    OptimizeOutcome { body: new_body, snapshot }
}

/// `llm_assisted`: summarizes all but an optional leading system message and the last
/// four messages, replacing that window with a single system message (spec §4.5).
async fn summarize_middle_window(
    client: &reqwest::Client,
    upstream_base: &str,
    messages: &[ChatMessage],
) -> Result<Vec<ChatMessage>, String> {
    let leading_system = messages.first().map(|m| m.role == "system").unwrap_or(false);
    let head_end = if leading_system { 1 } else { 0 };
    let tail_start = messages.len().saturating_sub(4).max(head_end);

    if tail_start <= head_end {
        return Err("no middle window to summarize".to_string());
    }

    let middle = &messages[head_end..tail_start];
    let transcript = middle
        .iter()
        .map(|m| format!("[{}]: {}", m.role.to_uppercase(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let request_body = serde_json::json!({
        "messages": [
            {"role": "system", "content": SUMMARIZATION_SYSTEM_PROMPT},
            {"role": "user", "content": transcript},
        ],
        "max_tokens": 512,
        "temperature": 0,
        "stream": false,
    });

    let url = format!("{}/v1/chat/completions", upstream_base.trim_end_matches('/'));
    let resp = client
        .post(url)
        .json(&request_body)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("summarization upstream returned {}", resp.status()));
    }
    let value: Value = resp.json().await.map_err(|e| e.to_string())?;
    let summary = value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| "missing summary content".to_string())?;

    let mut out = Vec::new();
    if leading_system {
        out.push(messages[0].clone());
    }
    out.push(ChatMessage {
        role: "system".to_string(),
        content: format!("LLM-assisted context summary: {summary}"),
    });
    out.extend(messages[tail_start..].iter().cloned());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn off_policy_passes_through_unchanged() {
        let client = reqwest::Client::new();
        let body = serde_json::json!({"messages": [{"role":"user","content":"hi"}]});
        let out = apply(
            &client,
            "http://127.0.0.1:1",
            PromptPolicy::Off,
            1024,
            32,
            TruncationMode::SlidingWindow,
            body.clone(),
        )
        .await;
        assert_eq!(out.body, body);
        assert!(!out.snapshot.applied);
    }

    #[tokio::test]
    async fn llm_assisted_with_few_messages_is_noop() {
        let client = reqwest::Client::new();
        let body = serde_json::json!({"messages": [{"role":"user","content":"hi"}]});
        let out = apply(
            &client,
            "http://127.0.0.1:1",
            PromptPolicy::LlmAssisted,
            1024,
            32,
            TruncationMode::SlidingWindow,
            body.clone(),
        )
        .await;
        assert!(!out.snapshot.applied);
        assert_eq!(out.body, body);
    }

    #[tokio::test]
    async fn llm_assisted_falls_back_to_low_vram_on_summarization_failure() {
        let client = reqwest::Client::new();
        let body = serde_json::json!({"messages": [
            {"role":"system","content":"sys"},
            {"role":"user","content":"a"},
            {"role":"assistant","content":"b"},
            {"role":"user","content":"c"},
            {"role":"assistant","content":"d"},
            {"role":"user","content":"e"},
        ]});
        // no server listening on this port: summarization request fails, so we expect
        // a fallback path that still reports applied=true per spec (body changed).
        let out = apply(
            &client,
            "http://127.0.0.1:1",
            PromptPolicy::LlmAssisted,
            1024,
            32,
            TruncationMode::SlidingWindow,
            body,
        )
        .await;
        assert!(out.snapshot.applied);
        assert!(out.snapshot.note.contains("fell back"));
    }

    #[tokio::test]
    async fn snapshot_bodies_are_recorded() {
        let client = reqwest::Client::new();
        let body = serde_json::json!({"messages": [{"role":"user","content":"hi"}]});
        let out = apply(
            &client,
            "http://127.0.0.1:1",
            PromptPolicy::Off,
            1024,
            32,
            TruncationMode::SlidingWindow,
            body,
        )
        .await;
        assert!(out.snapshot.original_body.contains("hi"));
        assert!(out.snapshot.optimized_body.contains("hi"));
    }
}
