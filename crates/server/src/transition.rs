//! Pure state transition function
//!
//! All session business logic lives here as a pure, synchronous function:
//! `transition(session, input, now_ms, rules) -> (session, effects)`.
//! No IO, no async, no locking. The store actor applies the effects.

use panedock_protocol::{
    ApprovalMode, EditorConnection, HookEvent, MessageRole, PermissionContext, SessionPhase,
    ToolResult,
};

use crate::session::{EditorLink, Session, SubagentState};
use crate::transcript::TranscriptBatch;

const TASK_TOOL: &str = "Task";

// ---------------------------------------------------------------------------
// Input: the closed set of things that can happen to a session
// ---------------------------------------------------------------------------

/// Which transcript a delta was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaSource {
    Session,
    Subagent { task_tool_use_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptDelta {
    pub source: DeltaSource,
    /// `false` for initial loads, truncations and post-`/clear` batches.
    pub incremental: bool,
    pub batch: TranscriptBatch,
}

/// A user action that was delivered successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approved { mode: ApprovalMode },
    Denied { message: Option<String> },
    MessageSent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Lifecycle(HookEvent),
    FileDelta(TranscriptDelta),
    ToolCompleted {
        tool_use_id: String,
        result: Option<ToolResult>,
    },
    Interrupted,
    EditorStatus {
        status: EditorConnection,
        editor: Option<EditorLink>,
    },
    UserDecision(Decision),
    StaleCandidate {
        evaluated_at_ms: u64,
        threshold_ms: u64,
    },
}

impl Input {
    /// Only inputs that prove the session exists may create it.
    pub fn creates_session(&self) -> bool {
        matches!(self, Input::Lifecycle(_) | Input::FileDelta(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Input::Lifecycle(_) => "lifecycle",
            Input::FileDelta(_) => "file_delta",
            Input::ToolCompleted { .. } => "tool_completed",
            Input::Interrupted => "interrupted",
            Input::EditorStatus { .. } => "editor_status",
            Input::UserDecision(_) => "user_decision",
            Input::StaleCandidate { .. } => "stale_candidate",
        }
    }
}

// ---------------------------------------------------------------------------
// Effects the store executes after a transition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Idempotent: watch the session transcript (and its interrupts).
    EnsureTranscriptWatch {
        cwd: String,
        transcript_path: Option<String>,
    },
    StartSubagentWatcher {
        task_tool_use_id: String,
        agent_id: String,
    },
    StopSubagentWatcher {
        task_tool_use_id: String,
    },
    /// Read a finished subagent's transcript once, from the start.
    LoadSubagentTranscript {
        task_tool_use_id: String,
        agent_id: String,
    },
    Remove {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Rules {
    pub stale_strike_limit: u32,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            stale_strike_limit: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Phase derivation
// ---------------------------------------------------------------------------

/// Phase implied by a lifecycle event, highest priority rule first.
/// `None` means the event says nothing about the phase.
pub fn derive_phase(event: &HookEvent, now_ms: u64) -> Option<SessionPhase> {
    let status = event.status.as_deref();

    if event.event_name == "PreCompact" || status == Some("compacting") {
        return Some(SessionPhase::Compacting);
    }

    if event.expects_response() {
        return Some(SessionPhase::WaitingForApproval(PermissionContext {
            tool_use_id: event.tool_use_id.clone(),
            tool_name: event.tool.clone().unwrap_or_else(|| "unknown".to_string()),
            tool_input: event.tool_input.clone(),
            received_at_ms: now_ms,
        }));
    }

    if event.event_name == "Notification"
        && event.notification_type.as_deref() == Some("idle_prompt")
    {
        return Some(SessionPhase::Idle);
    }

    let phase = match status {
        Some("waiting_for_input") => SessionPhase::WaitingForInput,
        Some("running_tool" | "processing" | "starting") => SessionPhase::Processing,
        Some("ended") => SessionPhase::Ended,
        Some(_) => SessionPhase::Idle,
        None => match event.event_name.as_str() {
            "SessionEnd" => SessionPhase::Ended,
            "SessionStart" => SessionPhase::Idle,
            "UserPromptSubmit" | "PreToolUse" | "PostToolUse" | "SubagentStart" => {
                SessionPhase::Processing
            }
            "Stop" => SessionPhase::WaitingForInput,
            _ => return None,
        },
    };
    Some(phase)
}

// ---------------------------------------------------------------------------
// The transition function
// ---------------------------------------------------------------------------

pub fn transition(
    mut session: Session,
    input: Input,
    now_ms: u64,
    rules: &Rules,
) -> (Session, Vec<Effect>) {
    let mut effects = Vec::new();

    match input {
        Input::Lifecycle(event) => {
            if session.phase.is_ended() && event.event_name != "SessionStart" {
                return (session, effects);
            }
            apply_lifecycle(&mut session, event, now_ms, &mut effects);
        }

        Input::FileDelta(delta) => {
            session.stale_strikes = 0;
            if delta.batch.entity_count() > 0 || !delta.incremental {
                session.last_activity_ms = now_ms;
            }
            apply_delta(&mut session, delta, &mut effects);
        }

        Input::ToolCompleted {
            tool_use_id,
            result,
        } => {
            session.stale_strikes = 0;
            session.last_activity_ms = now_ms;
            if let Some(ctx) = session.phase.permission() {
                if ctx.tool_use_id.as_deref() == Some(tool_use_id.as_str()) {
                    session.phase = SessionPhase::Processing;
                }
            }
            session.complete_tool(&tool_use_id, result);
        }

        Input::Interrupted => {
            session.stale_strikes = 0;
            session.last_activity_ms = now_ms;
            if !session.phase.is_ended() {
                session.phase = SessionPhase::Idle;
            }
            mark_open_tools_interrupted(&mut session);
        }

        Input::EditorStatus { status, editor } => {
            if let Some(link) = editor {
                session.editor = Some(match session.editor.take() {
                    Some(existing) if existing.pid == link.pid && link.endpoint.is_none() => existing,
                    _ => link,
                });
            }
            session.editor_status = status;
            if status == EditorConnection::Connected {
                session.stale_strikes = 0;
            }
        }

        Input::UserDecision(decision) => {
            session.stale_strikes = 0;
            let applies = match decision {
                Decision::Approved { .. } | Decision::Denied { .. } => {
                    matches!(session.phase, SessionPhase::WaitingForApproval(_))
                }
                Decision::MessageSent => matches!(
                    session.phase,
                    SessionPhase::Idle | SessionPhase::WaitingForInput
                ),
            };
            if applies {
                session.phase = SessionPhase::Processing;
                session.last_activity_ms = now_ms;
            }
        }

        Input::StaleCandidate {
            evaluated_at_ms,
            threshold_ms,
        } => {
            if evaluated_at_ms.saturating_sub(session.last_activity_ms) >= threshold_ms {
                session.stale_strikes += 1;
                if session.stale_strikes >= rules.stale_strike_limit {
                    effects.push(Effect::Remove {
                        reason: format!("stale after {} checks", session.stale_strikes),
                    });
                }
            } else {
                session.stale_strikes = 0;
            }
        }
    }

    (session, effects)
}

fn apply_lifecycle(session: &mut Session, event: HookEvent, now_ms: u64, effects: &mut Vec<Effect>) {
    session.stale_strikes = 0;
    session.last_activity_ms = now_ms;

    if let Some(cwd) = event.cwd.as_deref().filter(|c| !c.is_empty()) {
        session.cwd = cwd.to_string();
    }
    if event.pid.is_some() {
        session.pid = event.pid;
    }
    if event.tty.is_some() {
        session.tty = event.tty.clone();
    }
    if event.tmux_pane.is_some() {
        session.tmux_pane = event.tmux_pane.clone();
    }
    if event.transcript_path.is_some() && event.event_name != "SubagentStop" {
        session.transcript_path = event.transcript_path.clone();
    }

    if let Some(phase) = derive_phase(&event, now_ms) {
        // A repeated request for the tool already awaiting approval keeps its context.
        let repeated = match (&phase, &session.phase) {
            (SessionPhase::WaitingForApproval(new), SessionPhase::WaitingForApproval(current)) => {
                new.tool_use_id.is_some() && new.tool_use_id == current.tool_use_id
            }
            _ => false,
        };
        if !repeated {
            session.phase = phase;
        }
    }

    // Subagent watchers resolve their path from the session watch.
    if let Some(cwd) = event.cwd.as_deref().filter(|c| !c.is_empty()) {
        effects.push(Effect::EnsureTranscriptWatch {
            cwd: cwd.to_string(),
            transcript_path: session.transcript_path.clone(),
        });
    }

    let is_task = event.tool.as_deref() == Some(TASK_TOOL);
    match (event.event_name.as_str(), event.tool_use_id.as_deref()) {
        ("PreToolUse", Some(id)) if is_task => {
            let sub = session
                .subagents
                .entry(id.to_string())
                .or_insert_with(|| SubagentState::new(id));
            if let Some(agent_id) = event.agent_id.as_deref() {
                if sub.agent_id.is_none() && !sub.finished {
                    sub.agent_id = Some(agent_id.to_string());
                    effects.push(Effect::StartSubagentWatcher {
                        task_tool_use_id: id.to_string(),
                        agent_id: agent_id.to_string(),
                    });
                }
            }
        }
        ("PostToolUse", Some(id)) => {
            session.complete_tool(id, None);
            if let Some(sub) = session.subagents.get_mut(id) {
                if !sub.finished {
                    sub.finished = true;
                    if sub.agent_id.is_some() {
                        effects.push(Effect::StopSubagentWatcher {
                            task_tool_use_id: id.to_string(),
                        });
                    }
                }
            }
        }
        ("SubagentStart", _) => {
            if let Some(agent_id) = event.agent_id.as_deref() {
                attach_agent(session, agent_id, effects);
            }
        }
        _ => {}
    }
}

/// Link an announced agent to the running `Task` that has no agent yet.
fn attach_agent(session: &mut Session, agent_id: &str, effects: &mut Vec<Effect>) {
    if session
        .subagents
        .values()
        .any(|s| s.agent_id.as_deref() == Some(agent_id))
    {
        return;
    }
    let mut waiting: Vec<&mut SubagentState> = session
        .subagents
        .values_mut()
        .filter(|s| !s.finished && s.agent_id.is_none())
        .collect();
    waiting.sort_by(|a, b| a.task_tool_use_id.cmp(&b.task_tool_use_id));
    if let Some(sub) = waiting.into_iter().next() {
        sub.agent_id = Some(agent_id.to_string());
        effects.push(Effect::StartSubagentWatcher {
            task_tool_use_id: sub.task_tool_use_id.clone(),
            agent_id: agent_id.to_string(),
        });
    }
}

fn apply_delta(session: &mut Session, delta: TranscriptDelta, effects: &mut Vec<Effect>) {
    match delta.source {
        DeltaSource::Session => {
            let TranscriptBatch {
                messages,
                tool_results,
                subagent_links,
                ..
            } = delta.batch;

            if delta.incremental {
                session.append_messages(messages);
            } else {
                session.replace_messages(messages);
                session.tool_results.clear();
            }

            let mut linked = Vec::new();
            for link in subagent_links {
                let sub = session
                    .subagents
                    .entry(link.task_tool_use_id.clone())
                    .or_insert_with(|| SubagentState::new(link.task_tool_use_id.clone()));
                if sub.agent_id.is_none() {
                    sub.agent_id = Some(link.agent_id.clone());
                    linked.push((link.task_tool_use_id, link.agent_id));
                }
            }

            for result in tool_results {
                let id = result.tool_use_id.clone();
                let just_linked = linked.iter().any(|(task, _)| *task == id);
                if let Some(sub) = session.subagents.get_mut(&id) {
                    if !sub.finished {
                        sub.finished = true;
                        if sub.agent_id.is_some() && !just_linked {
                            effects.push(Effect::StopSubagentWatcher {
                                task_tool_use_id: id.clone(),
                            });
                        }
                    }
                }
                session.complete_tool(&id, Some(result));
            }

            // Newly linked agents never had a watcher. A finished one is read once.
            for (task_tool_use_id, agent_id) in linked {
                let finished = session
                    .subagents
                    .get(&task_tool_use_id)
                    .is_some_and(|s| s.finished);
                effects.push(if finished {
                    Effect::LoadSubagentTranscript {
                        task_tool_use_id,
                        agent_id,
                    }
                } else {
                    Effect::StartSubagentWatcher {
                        task_tool_use_id,
                        agent_id,
                    }
                });
            }
        }

        DeltaSource::Subagent { task_tool_use_id } => {
            let tools = delta.batch.subagent_tools();
            let sub = session
                .subagents
                .entry(task_tool_use_id.clone())
                .or_insert_with(|| SubagentState::new(task_tool_use_id));
            if !delta.incremental {
                sub.tools.clear();
            }
            sub.merge_tools(tools);
        }
    }
}

fn mark_open_tools_interrupted(session: &mut Session) {
    let open: Vec<String> = session
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::Assistant)
        .map(|m| {
            m.tool_uses
                .iter()
                .filter(|t| !session.completed_tools.contains(&t.id))
                .map(|t| t.id.clone())
                .collect()
        })
        .unwrap_or_default();

    for id in open {
        let result = ToolResult {
            tool_use_id: id.clone(),
            output: String::new(),
            is_error: false,
            interrupted: true,
        };
        session.complete_tool(&id, Some(result));
    }
}
