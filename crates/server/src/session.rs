//! Session entity owned by the store actor

use std::collections::{HashMap, HashSet};

use panedock_protocol::{
    EditorConnection, SessionPhase, SessionView, SubagentTool, SubagentView, ToolResult,
    TranscriptMessage,
};

/// Editor a session's terminal lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditorLink {
    pub pid: u32,
    pub endpoint: Option<String>,
}

/// A `Task` tool run and the transcript of the agent it spawned.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubagentState {
    pub task_tool_use_id: String,
    pub agent_id: Option<String>,
    pub tools: Vec<SubagentTool>,
    pub finished: bool,
}

impl SubagentState {
    pub fn new(task_tool_use_id: impl Into<String>) -> Self {
        Self {
            task_tool_use_id: task_tool_use_id.into(),
            ..Default::default()
        }
    }

    /// Upsert by tool id; completed tools stay completed.
    pub fn merge_tools(&mut self, tools: Vec<SubagentTool>) {
        for tool in tools {
            match self.tools.iter_mut().find(|t| t.id == tool.id) {
                Some(existing) => {
                    if existing.is_in_progress || tool.output.is_some() {
                        *existing = tool;
                    }
                }
                None => self.tools.push(tool),
            }
        }
    }

    fn view(&self) -> SubagentView {
        SubagentView {
            task_tool_use_id: self.task_tool_use_id.clone(),
            agent_id: self.agent_id.clone(),
            tools: self.tools.clone(),
            finished: self.finished,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub pid: Option<u32>,
    pub cwd: String,
    pub phase: SessionPhase,
    pub tmux_pane: Option<String>,
    pub tty: Option<String>,
    pub editor: Option<EditorLink>,
    pub editor_status: EditorConnection,
    pub last_activity_ms: u64,
    pub transcript_path: Option<String>,
    pub completed_tools: HashSet<String>,
    pub messages: Vec<TranscriptMessage>,
    message_ids: HashSet<String>,
    pub tool_results: HashMap<String, ToolResult>,
    pub subagents: HashMap<String, SubagentState>,
    pub stale_strikes: u32,
}

impl Session {
    pub fn new(id: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id: id.into(),
            pid: None,
            cwd: String::new(),
            phase: SessionPhase::Idle,
            tmux_pane: None,
            tty: None,
            editor: None,
            editor_status: EditorConnection::Unknown,
            last_activity_ms: now_ms,
            transcript_path: None,
            completed_tools: HashSet::new(),
            messages: Vec::new(),
            message_ids: HashSet::new(),
            tool_results: HashMap::new(),
            subagents: HashMap::new(),
            stale_strikes: 0,
        }
    }

    pub fn is_editor_backed(&self) -> bool {
        self.editor.is_some()
    }

    /// Append messages whose id is not present yet. Returns how many were added.
    pub fn append_messages(&mut self, messages: Vec<TranscriptMessage>) -> usize {
        let mut added = 0;
        for message in messages {
            if self.message_ids.insert(message.id.clone()) {
                self.messages.push(message);
                added += 1;
            }
        }
        added
    }

    pub fn replace_messages(&mut self, messages: Vec<TranscriptMessage>) {
        self.messages.clear();
        self.message_ids.clear();
        self.append_messages(messages);
    }

    /// Record a result and mark its tool completed. Re-applying is a no-op.
    pub fn complete_tool(&mut self, tool_use_id: &str, result: Option<ToolResult>) {
        self.completed_tools.insert(tool_use_id.to_string());
        if let Some(result) = result {
            self.tool_results.insert(tool_use_id.to_string(), result);
        }
    }

    pub fn view(&self) -> SessionView {
        let mut completed_tools: Vec<String> = self.completed_tools.iter().cloned().collect();
        completed_tools.sort();
        let mut subagents: Vec<SubagentView> = self.subagents.values().map(SubagentState::view).collect();
        subagents.sort_by(|a, b| a.task_tool_use_id.cmp(&b.task_tool_use_id));

        SessionView {
            id: self.id.clone(),
            cwd: self.cwd.clone(),
            pid: self.pid,
            phase: self.phase.clone(),
            tmux_pane: self.tmux_pane.clone(),
            editor_pid: self.editor.as_ref().map(|e| e.pid),
            editor_endpoint: self.editor.as_ref().and_then(|e| e.endpoint.clone()),
            editor_status: self.editor_status,
            last_activity_ms: self.last_activity_ms,
            transcript_path: self.transcript_path.clone(),
            completed_tools,
            messages: self.messages.clone(),
            tool_results: self.tool_results.clone(),
            subagents,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panedock_protocol::MessageRole;

    fn message(id: &str) -> TranscriptMessage {
        TranscriptMessage {
            id: id.into(),
            role: MessageRole::User,
            text: format!("text {id}"),
            tool_uses: Vec::new(),
            timestamp: None,
        }
    }

    fn tool(id: &str, output: Option<&str>) -> SubagentTool {
        SubagentTool {
            id: id.into(),
            tool_name: "Read".into(),
            summary: "x".into(),
            output: output.map(String::from),
            is_in_progress: output.is_none(),
        }
    }

    #[test]
    fn append_skips_known_ids() {
        let mut session = Session::new("s", 0);
        assert_eq!(session.append_messages(vec![message("a"), message("b")]), 2);
        assert_eq!(session.append_messages(vec![message("b"), message("c")]), 1);
        assert_eq!(session.messages.len(), 3);

        session.replace_messages(vec![message("z")]);
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.append_messages(vec![message("a")]), 1);
    }

    #[test]
    fn subagent_tools_upsert() {
        let mut sub = SubagentState::new("task");
        sub.merge_tools(vec![tool("t1", None)]);
        sub.merge_tools(vec![tool("t1", Some("done")), tool("t2", None)]);
        sub.merge_tools(vec![tool("t1", None)]);
        assert_eq!(sub.tools.len(), 2);
        assert_eq!(sub.tools[0].output.as_deref(), Some("done"));
    }

    #[test]
    fn view_is_sorted_and_complete() {
        let mut session = Session::new("s", 7);
        session.complete_tool("b", None);
        session.complete_tool("a", None);
        session.editor = Some(EditorLink {
            pid: 9,
            endpoint: Some("/tmp/nvim.9.0".into()),
        });
        let view = session.view();
        assert_eq!(view.completed_tools, vec!["a", "b"]);
        assert_eq!(view.editor_pid, Some(9));
        assert!(view.is_editor_backed());
        assert_eq!(view.last_activity_ms, 7);
    }
}
