//! Transcript JSONL parsing
//!
//! Each line is one record. Only `user` and `assistant` records with a `uuid`
//! matter here; everything else (summaries, snapshots, junk) is skipped.

use std::collections::HashMap;

use panedock_protocol::{MessageRole, SubagentTool, ToolResult, ToolUse, TranscriptMessage};
use serde_json::Value;

const INTERRUPT_MARKER: &str = "[Request interrupted by user";

/// A subagent transcript announced by a finished `Task` tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentLink {
    pub task_tool_use_id: String,
    pub agent_id: String,
}

/// One meaningful transcript line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLine {
    pub uuid: String,
    pub message: Option<TranscriptMessage>,
    pub tool_results: Vec<ToolResult>,
    pub subagent_links: Vec<SubagentLink>,
    pub is_clear: bool,
}

pub fn parse_line(line: &str) -> Option<ParsedLine> {
    let json: Value = serde_json::from_str(line.trim()).ok()?;
    let role = match json.get("type").and_then(Value::as_str)? {
        "user" => MessageRole::User,
        "assistant" => MessageRole::Assistant,
        "system" => MessageRole::System,
        _ => return None,
    };
    let uuid = json.get("uuid").and_then(Value::as_str)?.to_string();
    let timestamp = json
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_string);
    let content = json.get("message").and_then(|m| m.get("content"));

    let mut parsed = ParsedLine {
        uuid: uuid.clone(),
        ..Default::default()
    };

    let mut texts: Vec<String> = Vec::new();
    let mut tool_uses = Vec::new();
    match content {
        Some(Value::String(text)) => texts.push(text.clone()),
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            texts.push(text.to_string());
                        }
                    }
                    Some("tool_use") => {
                        let (Some(id), Some(name)) = (
                            block.get("id").and_then(Value::as_str),
                            block.get("name").and_then(Value::as_str),
                        ) else {
                            continue;
                        };
                        tool_uses.push(ToolUse {
                            id: id.to_string(),
                            name: name.to_string(),
                            input: block.get("input").cloned().unwrap_or(Value::Null),
                        });
                    }
                    Some("tool_result") => {
                        if let Some(result) = tool_result_from_block(block, &json) {
                            parsed.tool_results.push(result);
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {
            if role != MessageRole::System {
                return None;
            }
            if let Some(text) = json.get("content").and_then(Value::as_str) {
                texts.push(text.to_string());
            }
        }
    }

    if let Some(agent_id) = json
        .get("toolUseResult")
        .and_then(|r| r.get("agentId"))
        .and_then(Value::as_str)
    {
        if let Some(result) = parsed.tool_results.first() {
            parsed.subagent_links.push(SubagentLink {
                task_tool_use_id: result.tool_use_id.clone(),
                agent_id: agent_id.to_string(),
            });
        }
    }

    let text = texts.join("\n");
    parsed.is_clear = role == MessageRole::User && is_clear_command(&text);

    if !text.trim().is_empty() || !tool_uses.is_empty() {
        parsed.message = Some(TranscriptMessage {
            id: uuid,
            role,
            text,
            tool_uses,
            timestamp,
        });
    }

    if parsed.message.is_none() && parsed.tool_results.is_empty() && !parsed.is_clear {
        return None;
    }
    Some(parsed)
}

fn is_clear_command(text: &str) -> bool {
    let text = text.trim();
    text == "/clear" || text.contains("<command-name>/clear</command-name>")
}

fn tool_result_from_block(block: &Value, record: &Value) -> Option<ToolResult> {
    let tool_use_id = block.get("tool_use_id").and_then(Value::as_str)?.to_string();
    let output = extract_tool_result_content(block);
    let interrupted = record
        .get("toolUseResult")
        .and_then(|r| r.get("interrupted"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
        || output.contains(INTERRUPT_MARKER);
    Some(ToolResult {
        tool_use_id,
        is_error: block
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        output,
        interrupted,
    })
}

/// Extract text content from a tool_result item.
pub fn extract_tool_result_content(item: &Value) -> String {
    if let Some(content) = item.get("content").and_then(|c| c.as_str()) {
        return content.to_string();
    }

    if let Some(content_array) = item.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = content_array
            .iter()
            .filter_map(|block| {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    block.get("text").and_then(|t| t.as_str())
                } else {
                    None
                }
            })
            .collect();
        return texts.join("\n");
    }

    String::new()
}

/// Everything parsed out of one read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptBatch {
    pub messages: Vec<TranscriptMessage>,
    pub tool_results: Vec<ToolResult>,
    pub subagent_links: Vec<SubagentLink>,
    /// A `/clear` record was seen; only records after it are kept.
    pub cleared: bool,
}

impl TranscriptBatch {
    pub fn from_lines(lines: impl IntoIterator<Item = ParsedLine>) -> Self {
        let mut batch = TranscriptBatch::default();
        for line in lines {
            if line.is_clear {
                batch = TranscriptBatch {
                    cleared: true,
                    ..Default::default()
                };
                continue;
            }
            batch.messages.extend(line.message);
            batch.tool_results.extend(line.tool_results);
            batch.subagent_links.extend(line.subagent_links);
        }
        batch
    }

    /// Messages plus tool results.
    pub fn entity_count(&self) -> usize {
        self.messages.len() + self.tool_results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_count() == 0 && self.subagent_links.is_empty() && !self.cleared
    }

    /// Tool calls made in this batch, with outputs where already known.
    pub fn subagent_tools(&self) -> Vec<SubagentTool> {
        let outputs: HashMap<&str, &ToolResult> = self
            .tool_results
            .iter()
            .map(|r| (r.tool_use_id.as_str(), r))
            .collect();

        let mut tools = Vec::new();
        for message in self.messages.iter().filter(|m| m.role == MessageRole::Assistant) {
            for tool in &message.tool_uses {
                let output = outputs.get(tool.id.as_str()).map(|r| r.output.clone());
                tools.push(SubagentTool {
                    id: tool.id.clone(),
                    tool_name: tool.name.clone(),
                    summary: create_tool_summary(&tool.name, Some(&tool.input)),
                    is_in_progress: output.is_none(),
                    output,
                });
            }
        }
        tools
    }
}

/// Create a human-readable summary for a tool call.
pub fn create_tool_summary(tool_name: &str, input: Option<&Value>) -> String {
    let input = match input {
        Some(v) => v,
        None => return tool_name.to_string(),
    };
    let str_field = |key: &str| input.get(key).and_then(Value::as_str);

    match tool_name.to_lowercase().as_str() {
        "read" | "write" | "edit" | "multiedit" => {
            if let Some(path) = str_field("file_path") {
                return shorten_path(path);
            }
        }
        "bash" => {
            if let Some(cmd) = str_field("command") {
                return truncate_chars(cmd, 60).replace('\n', " ");
            }
        }
        "glob" => {
            if let Some(pattern) = str_field("pattern") {
                return pattern.to_string();
            }
        }
        "grep" => {
            if let Some(pattern) = str_field("pattern") {
                return format!("Pattern: {}", pattern);
            }
        }
        "task" => {
            if let Some(text) = str_field("description").or_else(|| str_field("prompt")) {
                return truncate_chars(text, 50);
            }
        }
        _ => {}
    }

    tool_name.to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Shorten a file path for display (last 2 components with .../ prefix).
fn shorten_path(path: &str) -> String {
    let components: Vec<&str> = path.split('/').collect();
    if components.len() > 3 {
        format!(".../{}", components[components.len() - 2..].join("/"))
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(value: Value) -> String {
        value.to_string()
    }

    #[test]
    fn parses_user_text_and_assistant_tool_use() {
        let user = parse_line(&line(json!({
            "type": "user", "uuid": "u1", "timestamp": "2026-01-01T00:00:00Z",
            "message": {"role": "user", "content": "fix the build"}
        })))
        .unwrap();
        let message = user.message.unwrap();
        assert_eq!(message.role, MessageRole::User);
        assert_eq!(message.text, "fix the build");

        let assistant = parse_line(&line(json!({
            "type": "assistant", "uuid": "a1",
            "message": {"content": [
                {"type": "text", "text": "Running tests"},
                {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "cargo test"}}
            ]}
        })))
        .unwrap();
        let message = assistant.message.unwrap();
        assert_eq!(message.tool_uses.len(), 1);
        assert_eq!(message.tool_uses[0].id, "toolu_1");
    }

    #[test]
    fn tool_results_and_subagent_links() {
        let parsed = parse_line(&line(json!({
            "type": "user", "uuid": "u2",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "toolu_task", "content": [{"type": "text", "text": "done"}]}
            ]},
            "toolUseResult": {"agentId": "abc123", "status": "completed"}
        })))
        .unwrap();
        assert!(parsed.message.is_none());
        assert_eq!(parsed.tool_results[0].output, "done");
        assert_eq!(
            parsed.subagent_links,
            vec![SubagentLink {
                task_tool_use_id: "toolu_task".into(),
                agent_id: "abc123".into()
            }]
        );
    }

    #[test]
    fn interrupted_result_is_flagged() {
        let parsed = parse_line(&line(json!({
            "type": "user", "uuid": "u3",
            "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t", "is_error": true,
                 "content": "[Request interrupted by user for tool use]"}
            ]}
        })))
        .unwrap();
        assert!(parsed.tool_results[0].interrupted);
        assert!(parsed.tool_results[0].is_error);
    }

    #[test]
    fn skips_malformed_and_irrelevant_lines() {
        assert!(parse_line("{not json").is_none());
        assert!(parse_line(&line(json!({"type": "summary", "summary": "x"}))).is_none());
        assert!(parse_line(&line(json!({"type": "user", "message": {"content": "no uuid"}}))).is_none());
    }

    #[test]
    fn clear_keeps_only_later_records() {
        let lines = [
            json!({"type": "user", "uuid": "1", "message": {"content": "before"}}),
            json!({"type": "user", "uuid": "2", "message": {"content": "<command-name>/clear</command-name>"}}),
            json!({"type": "user", "uuid": "3", "message": {"content": "after"}}),
        ];
        let batch = TranscriptBatch::from_lines(lines.iter().filter_map(|v| parse_line(&v.to_string())));
        assert!(batch.cleared);
        assert_eq!(batch.messages.len(), 1);
        assert_eq!(batch.messages[0].text, "after");
    }

    #[test]
    fn subagent_tools_pair_results() {
        let lines = [
            json!({"type": "assistant", "uuid": "a", "message": {"content": [
                {"type": "tool_use", "id": "t1", "name": "Read", "input": {"file_path": "/Users/me/project/src/main.rs"}},
                {"type": "tool_use", "id": "t2", "name": "Grep", "input": {"pattern": "fn main"}}
            ]}}),
            json!({"type": "user", "uuid": "b", "message": {"content": [
                {"type": "tool_result", "tool_use_id": "t1", "content": "fn main() {}"}
            ]}}),
        ];
        let batch = TranscriptBatch::from_lines(lines.iter().filter_map(|v| parse_line(&v.to_string())));
        let tools = batch.subagent_tools();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].summary, ".../src/main.rs");
        assert_eq!(tools[0].output.as_deref(), Some("fn main() {}"));
        assert!(!tools[0].is_in_progress);
        assert_eq!(tools[1].summary, "Pattern: fn main");
        assert!(tools[1].is_in_progress);
    }

    #[test]
    fn summaries_truncate_on_char_boundaries() {
        let long = "é".repeat(80);
        let summary = create_tool_summary("Bash", Some(&json!({"command": long})));
        assert!(summary.ends_with("..."));
        assert_eq!(summary.chars().count(), 63);
        assert_eq!(create_tool_summary("Unknown", None), "Unknown");
        assert_eq!(shorten_path("a/b/c"), "a/b/c");
    }
}
