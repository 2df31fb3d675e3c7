//! Core types shared across the protocol

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Pending tool request awaiting a user decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionContext {
    pub tool_use_id: Option<String>,
    pub tool_name: String,
    pub tool_input: Option<Value>,
    pub received_at_ms: u64,
}

/// What the agent session is doing right now.
///
/// Only `WaitingForApproval` carries a payload, so a permission context
/// cannot exist outside that phase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Processing,
    WaitingForApproval(PermissionContext),
    WaitingForInput,
    Compacting,
    Ended,
}

impl SessionPhase {
    pub fn permission(&self) -> Option<&PermissionContext> {
        match self {
            SessionPhase::WaitingForApproval(ctx) => Some(ctx),
            _ => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, SessionPhase::Ended)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Processing => "processing",
            SessionPhase::WaitingForApproval(_) => "waiting_for_approval",
            SessionPhase::WaitingForInput => "waiting_for_input",
            SessionPhase::Compacting => "compacting",
            SessionPhase::Ended => "ended",
        }
    }
}

/// Connection health between a session and its companion editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditorConnection {
    #[default]
    Unknown,
    Checking,
    Connected,
    Disconnected,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// A tool invocation recorded in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

/// One transcript record, identified by the record's `uuid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub id: String,
    pub role: MessageRole,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_uses: Vec<ToolUse>,
    pub timestamp: Option<String>,
}

/// Output of a finished tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub interrupted: bool,
}

/// A tool call made by a subagent, summarized for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentTool {
    pub id: String,
    pub tool_name: String,
    pub summary: String,
    pub output: Option<String>,
    pub is_in_progress: bool,
}

/// A running or finished subagent spawned by a Task tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentView {
    pub task_tool_use_id: String,
    pub agent_id: Option<String>,
    pub tools: Vec<SubagentTool>,
    pub finished: bool,
}

/// Multiplexer address, written `session:window.pane`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaneTarget {
    pub session: String,
    pub window: u32,
    pub pane: u32,
}

impl fmt::Display for PaneTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.session, self.window, self.pane)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePaneTargetError(pub String);

impl fmt::Display for ParsePaneTargetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pane target: {}", self.0)
    }
}

impl std::error::Error for ParsePaneTargetError {}

impl FromStr for PaneTarget {
    type Err = ParsePaneTargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePaneTargetError(s.to_string());
        // Session names may contain ':' so split from the right.
        let (session, rest) = s.rsplit_once(':').ok_or_else(err)?;
        let (window, pane) = rest.split_once('.').ok_or_else(err)?;
        if session.is_empty() {
            return Err(err());
        }
        Ok(PaneTarget {
            session: session.to_string(),
            window: window.parse().map_err(|_| err())?,
            pane: pane.parse().map_err(|_| err())?,
        })
    }
}

/// How an editor instance was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Registry,
    SessionPid,
    ProcessScan,
    PaneScan,
}

/// A companion editor process and the endpoint its RPC surface listens on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditorInstance {
    pub pid: u32,
    pub endpoint: String,
    pub cwd: Option<String>,
    pub source: DiscoverySource,
    pub checked_at_ms: u64,
}

/// Published, read-only view of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub id: String,
    pub cwd: String,
    pub pid: Option<u32>,
    pub phase: SessionPhase,
    pub tmux_pane: Option<String>,
    pub editor_pid: Option<u32>,
    pub editor_endpoint: Option<String>,
    pub editor_status: EditorConnection,
    pub last_activity_ms: u64,
    pub transcript_path: Option<String>,
    pub completed_tools: Vec<String>,
    pub messages: Vec<TranscriptMessage>,
    pub tool_results: HashMap<String, ToolResult>,
    pub subagents: Vec<SubagentView>,
}

impl SessionView {
    pub fn is_editor_backed(&self) -> bool {
        self.editor_pid.is_some()
    }
}

/// How long an approval should stick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Once,
    Always,
}

impl ApprovalMode {
    /// Literal answer typed into the agent's permission prompt.
    pub fn keystroke(self) -> &'static str {
        match self {
            ApprovalMode::Once => "1",
            ApprovalMode::Always => "2",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pane_target_round_trips_through_display() {
        let target: PaneTarget = "main:0.1".parse().unwrap();
        assert_eq!(target.session, "main");
        assert_eq!(target.window, 0);
        assert_eq!(target.pane, 1);
        assert_eq!(target.to_string(), "main:0.1");
    }

    #[test]
    fn pane_target_allows_colons_in_session_name() {
        let target: PaneTarget = "work:api:2.3".parse().unwrap();
        assert_eq!(target.session, "work:api");
        assert_eq!(target.window, 2);
        assert_eq!(target.pane, 3);
    }

    #[test]
    fn pane_target_rejects_garbage() {
        assert!("main".parse::<PaneTarget>().is_err());
        assert!(":0.0".parse::<PaneTarget>().is_err());
        assert!("main:x.0".parse::<PaneTarget>().is_err());
    }

    #[test]
    fn phase_serializes_with_tag_and_payload() {
        let phase = SessionPhase::WaitingForApproval(PermissionContext {
            tool_use_id: Some("toolu_1".into()),
            tool_name: "Bash".into(),
            tool_input: None,
            received_at_ms: 5,
        });
        let json = serde_json::to_value(&phase).unwrap();
        assert_eq!(json["phase"], "waiting_for_approval");
        assert_eq!(json["tool_name"], "Bash");

        let idle = serde_json::to_value(SessionPhase::Idle).unwrap();
        assert_eq!(idle, serde_json::json!({"phase": "idle"}));
    }
}
