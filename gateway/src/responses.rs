//! Responses Bridge (spec §4.6): translates `responses`-shaped requests into
//! `chat/completions` requests and chat completion objects back into `response`
//! objects, emitting a synthetic `text/event-stream` when the client asked to stream.
//!
//! Streaming emulation follows spec §9 "buffer then emit the fixed synthetic
//! schedule" — there is no attempt to interleave a real upstream stream.

use serde_json::{json, Value};
use uuid::Uuid;

const FIELDS_COPIED_VERBATIM: &[&str] = &[
    "model",
    "temperature",
    "top_p",
    "presence_penalty",
    "frequency_penalty",
    "stop",
    "n",
    "tool_choice",
    "parallel_tool_calls",
    "metadata",
];

/// Forward translation (spec §4.6 "Forward").
pub fn to_chat_completions(responses_body: &Value) -> Value {
    let mut chat = serde_json::Map::new();

    for field in FIELDS_COPIED_VERBATIM {
        if let Some(v) = responses_body.get(field) {
            chat.insert(field.to_string(), v.clone());
        }
    }
    if let Some(max_output) = responses_body.get("max_output_tokens") {
        chat.insert("max_tokens".to_string(), max_output.clone());
    }
    if let Some(tools) = responses_body.get("tools").and_then(Value::as_array) {
        chat.insert("tools".to_string(), Value::Array(normalize_tools(tools)));
    }

    chat.insert("messages".to_string(), Value::Array(build_messages(responses_body)));
    chat.insert("stream".to_string(), Value::Bool(false));

    Value::Object(chat)
}

/// Accepts both `{type:"function", function:{...}}` and flat `{name, description,
/// parameters}` tool shapes, dropping non-`function` kinds (spec §4.6).
fn normalize_tools(tools: &[Value]) -> Vec<Value> {
    tools
        .iter()
        .filter_map(|t| {
            if let Some(kind) = t.get("type").and_then(Value::as_str) {
                if kind != "function" {
                    return None;
                }
                if let Some(function) = t.get("function") {
                    return Some(json!({ "type": "function", "function": function }));
                }
            }
            let name = t.get("name")?.clone();
            Some(json!({
                "type": "function",
                "function": {
                    "name": name,
                    "description": t.get("description").cloned().unwrap_or(Value::Null),
                    "parameters": t.get("parameters").cloned().unwrap_or_else(|| json!({})),
                }
            }))
        })
        .collect()
}

fn non_empty_content(content: &Value) -> Value {
    match content {
        Value::String(s) if s.is_empty() => Value::String(" ".to_string()),
        Value::Null => Value::String(" ".to_string()),
        other => other.clone(),
    }
}

/// Builds the chat `messages[]` array (spec §4.6 "Build messages").
fn build_messages(body: &Value) -> Vec<Value> {
    let mut messages = Vec::new();

    if let Some(instructions) = body.get("instructions").and_then(Value::as_str) {
        messages.push(json!({ "role": "system", "content": instructions }));
    }

    let items = body
        .get("input")
        .and_then(Value::as_array)
        .or_else(|| body.get("messages").and_then(Value::as_array));

    if let Some(items) = items {
        for item in items {
            messages.extend(translate_item(item));
        }
    } else if let Some(text) = body.get("input").and_then(Value::as_str) {
        messages.push(json!({ "role": "user", "content": text }));
    }

    messages
}

fn translate_item(item: &Value) -> Vec<Value> {
    let item_type = item.get("type").and_then(Value::as_str);

    if item_type == Some("function_call") {
        let call_id = item
            .get("call_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
        return vec![json!({
            "role": "assistant",
            "content": Value::Null,
            "tool_calls": [{
                "id": call_id,
                "type": "function",
                "function": {
                    "name": item.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": item.get("arguments").cloned().unwrap_or(Value::String("{}".to_string())),
                }
            }]
        })];
    }

    if item_type == Some("function_call_output") {
        return vec![json!({
            "role": "tool",
            "tool_call_id": item.get("call_id").cloned().unwrap_or(Value::Null),
            "content": item.get("output").cloned().unwrap_or(Value::Null),
        })];
    }

    let role = item.get("role").and_then(Value::as_str).unwrap_or("user");
    let role = if role == "developer" { "system" } else { role };
    let content = non_empty_content(item.get("content").unwrap_or(&Value::Null));
    vec![json!({ "role": role, "content": content })]
}

/// Reverse translation (spec §4.6 "Reverse").
pub fn to_response(chat_completion: &Value) -> Value {
    let chat_id = chat_completion.get("id").and_then(Value::as_str).unwrap_or("unknown");
    let id = format!("resp_{chat_id}");

    let message = chat_completion
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"));

    let mut output = Vec::new();
    if let Some(text) = message.and_then(|m| m.get("content")).and_then(Value::as_str) {
        if !text.is_empty() {
            output.push(json!({
                "type": "message",
                "role": "assistant",
                "content": [{ "type": "output_text", "text": text }],
            }));
        }
    }
    if let Some(tool_calls) = message.and_then(|m| m.get("tool_calls")).and_then(Value::as_array) {
        for call in tool_calls {
            output.push(json!({
                "type": "function_call",
                "call_id": call.get("id").cloned().unwrap_or(Value::Null),
                "name": call.get("function").and_then(|f| f.get("name")).cloned().unwrap_or(Value::Null),
                "arguments": call.get("function").and_then(|f| f.get("arguments")).cloned().unwrap_or(Value::Null),
            }));
        }
    }

    let usage = chat_completion.get("usage").map(|u| {
        json!({
            "input_tokens": u.get("prompt_tokens").cloned().unwrap_or(json!(0)),
            "output_tokens": u.get("completion_tokens").cloned().unwrap_or(json!(0)),
            "total_tokens": u.get("total_tokens").cloned().unwrap_or(json!(0)),
        })
    });

    let mut response = serde_json::Map::new();
    response.insert("id".to_string(), Value::String(id));
    response.insert("object".to_string(), Value::String("response".to_string()));
    response.insert("status".to_string(), Value::String("completed".to_string()));
    response.insert("output".to_string(), Value::Array(output));
    if let Some(usage) = usage {
        response.insert("usage".to_string(), usage);
    }
    Value::Object(response)
}

/// Extracts the concatenated `output_text` across all message-type output items, used
/// both to build `response.completed`'s top-level convenience field and by tests
/// checking the streaming-reconstruction invariant (spec §8).
fn output_text(response: &Value) -> String {
    response
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("message"))
        .flat_map(|item| item.get("content").and_then(Value::as_array).into_iter().flatten())
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect()
}

/// Emits the fixed synthetic SSE schedule (spec §4.6 "Streaming emulation").
/// Each line is already framed as `data: <json>\n\n`, the last being the sentinel
/// `data: [DONE]\n\n`.
pub fn stream_response(response: &Value) -> Vec<String> {
    let mut seq = 0u64;
    let mut lines = Vec::new();
    let mut emit = |event_type: &str, mut payload: Value| {
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("type".to_string(), Value::String(event_type.to_string()));
            obj.insert("sequence_number".to_string(), json!(seq));
        }
        seq += 1;
        lines.push(format!("data: {}\n\n", serde_json::to_string(&payload).expect("serializable")));
    };

    let response_id = response.get("id").cloned().unwrap_or(Value::Null);

    emit("response.created", json!({ "response": response }));
    emit("response.in_progress", json!({ "response": response }));

    let output = response.get("output").and_then(Value::as_array).cloned().unwrap_or_default();
    for (index, item) in output.iter().enumerate() {
        emit("response.output_item.added", json!({ "output_index": index, "item": item }));

        if item.get("type").and_then(Value::as_str) == Some("message") {
            if let Some(parts) = item.get("content").and_then(Value::as_array) {
                for (part_index, part) in parts.iter().enumerate() {
                    emit("response.content_part.added", json!({ "output_index": index, "content_index": part_index, "part": part }));
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        emit("response.output_text.delta", json!({ "output_index": index, "content_index": part_index, "delta": text }));
                        emit("response.output_text.done", json!({ "output_index": index, "content_index": part_index, "text": text }));
                    }
                    emit("response.content_part.done", json!({ "output_index": index, "content_index": part_index, "part": part }));
                }
            }
        } else if item.get("type").and_then(Value::as_str) == Some("function_call") {
            let args = item.get("arguments").and_then(Value::as_str).unwrap_or("");
            emit("response.function_call_arguments.delta", json!({ "output_index": index, "delta": args }));
            emit("response.function_call_arguments.done", json!({ "output_index": index, "arguments": args }));
        }

        emit("response.output_item.done", json!({ "output_index": index, "item": item }));
    }

    let mut completed = response.clone();
    if let Some(obj) = completed.as_object_mut() {
        obj.insert("output_text".to_string(), Value::String(output_text(response)));
    }
    emit("response.completed", json!({ "response": completed, "id": response_id }));

    lines.push("data: [DONE]\n\n".to_string());
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_copies_scalar_fields_and_renames_max_output_tokens() {
        let body = json!({
            "model": "m",
            "temperature": 0.2,
            "max_output_tokens": 128,
            "input": "hi",
        });
        let chat = to_chat_completions(&body);
        assert_eq!(chat["model"], "m");
        assert_eq!(chat["max_tokens"], 128);
        assert_eq!(chat["stream"], false);
        assert_eq!(chat["messages"][0]["role"], "user");
        assert_eq!(chat["messages"][0]["content"], "hi");
    }

    #[test]
    fn forward_prepends_instructions_as_system_message() {
        let body = json!({ "instructions": "be terse", "input": "hi" });
        let chat = to_chat_completions(&body);
        assert_eq!(chat["messages"][0]["role"], "system");
        assert_eq!(chat["messages"][0]["content"], "be terse");
        assert_eq!(chat["messages"][1]["role"], "user");
    }

    #[test]
    fn forward_translates_function_call_and_output_items() {
        let body = json!({
            "input": [
                {"type": "function_call", "call_id": "call_1", "name": "search", "arguments": "{}"},
                {"type": "function_call_output", "call_id": "call_1", "output": "result text"},
            ]
        });
        let chat = to_chat_completions(&body);
        let messages = chat["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "assistant");
        assert_eq!(messages[0]["tool_calls"][0]["id"], "call_1");
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "call_1");
    }

    #[test]
    fn forward_maps_developer_role_to_system_and_fills_empty_content() {
        let body = json!({ "input": [{"role": "developer", "content": ""}] });
        let chat = to_chat_completions(&body);
        assert_eq!(chat["messages"][0]["role"], "system");
        assert_eq!(chat["messages"][0]["content"], " ");
    }

    #[test]
    fn normalize_tools_drops_non_function_and_accepts_flat_shape() {
        let tools = vec![
            json!({"type": "function", "function": {"name": "a"}}),
            json!({"type": "web_search"}),
            json!({"name": "flat_tool", "description": "d", "parameters": {}}),
        ];
        let out = normalize_tools(&tools);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["function"]["name"], "a");
        assert_eq!(out[1]["function"]["name"], "flat_tool");
    }

    #[test]
    fn reverse_builds_message_and_usage() {
        let chat = json!({
            "id": "chatcmpl-1",
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6},
        });
        let response = to_response(&chat);
        assert!(response["id"].as_str().unwrap().starts_with("resp_"));
        assert_eq!(response["output"][0]["content"][0]["text"], "hello");
        assert_eq!(response["usage"]["input_tokens"], 5);
    }

    #[test]
    fn reverse_builds_function_call_output_items() {
        let chat = json!({
            "id": "chatcmpl-2",
            "choices": [{"message": {"content": null, "tool_calls": [
                {"id": "call_1", "function": {"name": "search", "arguments": "{}"}}
            ]}}],
        });
        let response = to_response(&chat);
        assert_eq!(response["output"][0]["type"], "function_call");
        assert_eq!(response["output"][0]["name"], "search");
    }

    #[test]
    fn stream_response_emits_fixed_schedule_for_message_output() {
        let chat = json!({
            "id": "chatcmpl-3",
            "choices": [{"message": {"content": "hello"}}],
        });
        let response = to_response(&chat);
        let lines = stream_response(&response);

        let event_types: Vec<Value> = lines
            .iter()
            .filter(|l| *l != "data: [DONE]\n\n")
            .map(|l| {
                let json_str = l.trim_start_matches("data: ").trim_end();
                serde_json::from_str::<Value>(json_str).unwrap()["type"].clone()
            })
            .collect();

        assert_eq!(
            event_types,
            vec![
                json!("response.created"),
                json!("response.in_progress"),
                json!("response.output_item.added"),
                json!("response.content_part.added"),
                json!("response.output_text.delta"),
                json!("response.output_text.done"),
                json!("response.content_part.done"),
                json!("response.output_item.done"),
                json!("response.completed"),
            ]
        );
        assert_eq!(lines.last().unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn stream_response_delta_reconstructs_final_output_text() {
        let chat = json!({
            "id": "chatcmpl-4",
            "choices": [{"message": {"content": "hello world"}}],
        });
        let response = to_response(&chat);
        let lines = stream_response(&response);

        let mut reconstructed = String::new();
        let mut final_text = String::new();
        for line in &lines {
            if line == "data: [DONE]\n\n" {
                continue;
            }
            let value: Value = serde_json::from_str(line.trim_start_matches("data: ").trim_end()).unwrap();
            if value["type"] == "response.output_text.delta" {
                reconstructed.push_str(value["delta"].as_str().unwrap());
            }
            if value["type"] == "response.completed" {
                final_text = value["response"]["output_text"].as_str().unwrap().to_string();
            }
        }
        assert_eq!(reconstructed, final_text);
        assert_eq!(final_text, "hello world");
    }
}
