//! Inbound messages: agent hook events and user intents

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::ApprovalMode;

/// Lifecycle notification emitted by an agent hook.
///
/// Only `session_id` is required. Everything else is optional and
/// defaulted when missing or malformed (see [`HookEvent::from_value`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookEvent {
    pub session_id: String,
    #[serde(default, alias = "event", alias = "hook_event_name")]
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "tool_name", skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_pane: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
}

impl HookEvent {
    /// Lenient decode: a field with the wrong type is dropped instead of
    /// failing the whole event. Returns `None` only without a session id.
    pub fn from_value(value: &Value) -> Option<HookEvent> {
        let obj = value.as_object()?;
        let string = |keys: &[&str]| -> Option<String> {
            keys.iter().find_map(|k| {
                obj.get(*k)
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
            })
        };

        let session_id = string(&["session_id"])?;
        let pid = obj.get("pid").and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse::<u64>().ok()))
                .and_then(|n| u32::try_from(n).ok())
        });

        Some(HookEvent {
            session_id,
            event_name: string(&["event_name", "event", "hook_event_name"]).unwrap_or_default(),
            status: string(&["status"]),
            tool: string(&["tool", "tool_name"]),
            tool_use_id: string(&["tool_use_id"]),
            notification_type: string(&["notification_type"]),
            tool_input: obj.get("tool_input").filter(|v| !v.is_null()).cloned(),
            cwd: string(&["cwd"]),
            pid,
            tty: string(&["tty"]),
            tmux_pane: string(&["tmux_pane"]),
            agent_id: string(&["agent_id"]),
            transcript_path: string(&["transcript_path", "agent_transcript_path"]),
        })
    }

    /// True when the hook is a tool request that blocks on a user answer.
    pub fn expects_response(&self) -> bool {
        self.event_name == "PermissionRequest"
            && self.status.as_deref() == Some("waiting_for_approval")
    }
}

/// User intents sent by UI clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    ApproveTool {
        session_id: String,
        #[serde(default)]
        mode: ApprovalMode,
    },
    DenyTool {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SendMessage {
        session_id: String,
        content: String,
    },
}

impl ClientMessage {
    pub fn session_id(&self) -> &str {
        match self {
            ClientMessage::ApproveTool { session_id, .. }
            | ClientMessage::DenyTool { session_id, .. }
            | ClientMessage::SendMessage { session_id, .. } => session_id,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            ClientMessage::ApproveTool { .. } => "approve",
            ClientMessage::DenyTool { .. } => "reject",
            ClientMessage::SendMessage { .. } => "send_text",
        }
    }
}
