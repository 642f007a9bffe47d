//! Mapping of JSON-lines agent output onto normalized events
//!
//! Agent CLIs that stream JSON share a rough shape: a start record carrying a
//! conversation id, assistant text, tool invocations and their results, and a
//! closing summary with usage. The shapes recognised here:
//!
//! - Claude Code `--output-format stream-json`: `system`, `assistant`,
//!   `user` (tool results), `result`
//! - Codex `exec --json`: `thread.started`, `item.started` /
//!   `item.completed`, `turn.completed`, `turn.failed`, `error`
//! - Gemini `--output-format stream-json`: `init`, `message`, `tool_use`,
//!   `tool_result`, `result`
//!
//! Anything unrecognised is ignored; only unparseable lines reach the raw
//! passthrough in the normalizer.

use super::Usage;
use serde_json::Value;

/// What one JSON record means, before it becomes events
#[derive(Debug, Clone, PartialEq)]
pub enum Interpreted {
    /// Assistant text. `delta` fragments concatenate without separators.
    Text { content: String, delta: bool },
    ToolCall { name: String, input: Value },
    ToolResult { content: String },
    /// Conversation id the tool can resume from
    ResumeToken(String),
    /// Closing summary
    Result {
        content: Option<String>,
        usage: Usage,
        is_error: bool,
    },
    /// Usage reported outside a summary record
    Usage(Usage),
    /// The tool reported a failure
    Failure(String),
    /// A JSON value that is not a record, passed through as text
    Raw(String),
}

/// Interpret one parsed JSON line.
pub fn interpret(value: &Value) -> Vec<Interpreted> {
    let Some(obj) = value.as_object() else {
        let raw = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return vec![Interpreted::Raw(raw)];
    };

    let mut out = Vec::new();
    if let Some(token) = ["session_id", "sessionId", "thread_id"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .filter(|token| !token.is_empty())
    {
        out.push(Interpreted::ResumeToken(token.to_string()));
    }

    let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "assistant" => interpret_message(value, &mut out),
        "user" => interpret_tool_results(value, &mut out),
        "message" => {
            if obj.get("role").and_then(Value::as_str) == Some("assistant") {
                if let Some(content) = text_of(obj.get("content")) {
                    let delta = obj.get("delta").and_then(Value::as_bool).unwrap_or(false);
                    out.push(Interpreted::Text { content, delta });
                }
            }
        }
        "text" => {
            if let Some(content) = text_of(obj.get("text").or_else(|| obj.get("content"))) {
                out.push(Interpreted::Text {
                    content,
                    delta: false,
                });
            }
        }
        "tool_use" | "tool_call" => out.push(Interpreted::ToolCall {
            name: string_field(value, &["name", "tool_name"]).unwrap_or_else(|| "tool".to_string()),
            input: ["input", "parameters", "arguments"]
                .iter()
                .find_map(|key| obj.get(*key).cloned())
                .unwrap_or(Value::Null),
        }),
        "tool_result" => out.push(Interpreted::ToolResult {
            content: text_of(obj.get("content").or_else(|| obj.get("output"))).unwrap_or_default(),
        }),
        "result" => {
            let subtype = obj.get("subtype").and_then(Value::as_str).unwrap_or_default();
            let status = obj.get("status").and_then(Value::as_str).unwrap_or_default();
            let is_error = obj.get("is_error").and_then(Value::as_bool).unwrap_or(false)
                || subtype.starts_with("error")
                || status == "error";
            out.push(Interpreted::Result {
                content: string_field(value, &["result", "response"]),
                usage: usage_of(value),
                is_error,
            });
        }
        "item.started" | "item.completed" => interpret_item(value, kind == "item.completed", &mut out),
        "turn.completed" => out.push(Interpreted::Usage(usage_of(value))),
        "turn.failed" | "error" => {
            let message = obj
                .get("error")
                .and_then(|e| string_field(e, &["message"]).or_else(|| e.as_str().map(str::to_string)))
                .or_else(|| string_field(value, &["message"]))
                .unwrap_or_else(|| "agent reported an error".to_string());
            out.push(Interpreted::Failure(message));
        }
        _ => {}
    }
    out
}

fn interpret_message(value: &Value, out: &mut Vec<Interpreted>) {
    let content = value.pointer("/message/content");
    match content {
        Some(Value::String(text)) => out.push(Interpreted::Text {
            content: text.clone(),
            delta: false,
        }),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            out.push(Interpreted::Text {
                                content: text.to_string(),
                                delta: false,
                            });
                        }
                    }
                    Some("tool_use") => out.push(Interpreted::ToolCall {
                        name: string_field(block, &["name"]).unwrap_or_else(|| "tool".to_string()),
                        input: block.get("input").cloned().unwrap_or(Value::Null),
                    }),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

fn interpret_tool_results(value: &Value, out: &mut Vec<Interpreted>) {
    if let Some(Value::Array(blocks)) = value.pointer("/message/content") {
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("tool_result") {
                out.push(Interpreted::ToolResult {
                    content: text_of(block.get("content")).unwrap_or_default(),
                });
            }
        }
    }
}

fn interpret_item(value: &Value, completed: bool, out: &mut Vec<Interpreted>) {
    let Some(item) = value.get("item") else {
        return;
    };
    match (item.get("type").and_then(Value::as_str), completed) {
        (Some("agent_message"), true) => {
            if let Some(text) = string_field(item, &["text"]) {
                out.push(Interpreted::Text {
                    content: text,
                    delta: false,
                });
            }
        }
        (Some("command_execution"), false) => out.push(Interpreted::ToolCall {
            name: "command_execution".to_string(),
            input: serde_json::json!({ "command": item.get("command").cloned().unwrap_or(Value::Null) }),
        }),
        (Some("command_execution"), true) => out.push(Interpreted::ToolResult {
            content: string_field(item, &["aggregated_output"]).unwrap_or_default(),
        }),
        (Some("mcp_tool_call"), false) => out.push(Interpreted::ToolCall {
            name: string_field(item, &["tool"]).unwrap_or_else(|| "mcp_tool_call".to_string()),
            input: item.get("arguments").cloned().unwrap_or(Value::Null),
        }),
        (Some("mcp_tool_call"), true) => out.push(Interpreted::ToolResult {
            content: text_of(item.get("result")).unwrap_or_default(),
        }),
        _ => {}
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

/// Flatten a content field: plain strings, arrays of `{type: text}` blocks,
/// or any other JSON rendered compactly.
fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str).or_else(|| p.as_str()))
                .collect();
            Some(texts.join("\n"))
        }
        other => Some(other.to_string()),
    }
}

fn usage_of(value: &Value) -> Usage {
    let mut usage = Usage::default();
    for scope in [value.get("usage"), value.get("stats"), Some(value)]
        .into_iter()
        .flatten()
    {
        let num = |key: &str| scope.get(key).and_then(Value::as_u64);
        usage.merge(Usage {
            input_tokens: num("input_tokens"),
            output_tokens: num("output_tokens"),
            cache_read_tokens: num("cache_read_input_tokens").or_else(|| num("cached_input_tokens")),
            cost_usd: scope
                .get("total_cost_usd")
                .or_else(|| scope.get("cost_usd"))
                .and_then(Value::as_f64),
            duration_ms: num("duration_ms"),
            num_turns: num("num_turns").and_then(|n| u32::try_from(n).ok()),
        });
    }
    usage
}
