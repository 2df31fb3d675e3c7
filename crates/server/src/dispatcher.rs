//! Routes user actions to the terminal a session runs in.
//!
//! Editor-backed sessions go through the editor bridge; everything else
//! (and editor sessions whose instance cannot be found) gets tmux keystrokes.
//! The store only hears about an action once it was delivered.

use std::sync::Arc;

use panedock_protocol::{
    ActionOutcome, ApprovalMode, ClientMessage, PaneTarget, ServerMessage, SessionPhase,
    SessionView,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::editor::{EditorQuery, EditorResolver, EditorRpc};
use crate::error::{DispatchError, ResolveError};
use crate::process_tree::ProcessSnapshotter;
use crate::services::Services;
use crate::session_store::SessionStore;
use crate::tmux::{PaneQuery, TmuxClient};
use crate::transition::{Decision, Input};

/// One deliverable action, independent of transport.
#[derive(Debug, Clone, Copy)]
enum Action<'a> {
    Approve(ApprovalMode),
    Reject(Option<&'a str>),
    SendText(&'a str),
}

impl Action<'_> {
    fn rpc(&self) -> (&'static str, Value) {
        match self {
            Action::Approve(mode) => ("approve", json!({ "mode": mode })),
            Action::Reject(message) => ("reject", json!({ "message": message })),
            Action::SendText(text) => ("send_text", json!({ "text": text })),
        }
    }
}

pub struct Dispatcher {
    store: SessionStore,
    tmux: Arc<TmuxClient>,
    editors: Arc<EditorResolver>,
    rpc: Arc<EditorRpc>,
    processes: Arc<ProcessSnapshotter>,
}

impl Dispatcher {
    pub fn new(store: SessionStore, services: &Services) -> Self {
        Self {
            store,
            tmux: services.tmux.clone(),
            editors: services.editors.clone(),
            rpc: services.rpc.clone(),
            processes: services.processes.clone(),
        }
    }

    pub async fn dispatch(&self, message: ClientMessage) -> ActionOutcome {
        let session_id = message.session_id().to_string();
        let action_name = message.action_name();

        let outcome = match self.deliver(&message).await {
            Ok(decision) => {
                info!(
                    component = "dispatcher",
                    event = "dispatcher.action_delivered",
                    session_id = %session_id,
                    action = action_name,
                    "Action delivered"
                );
                self.store
                    .sink()
                    .submit(&session_id, Input::UserDecision(decision))
                    .await;
                ActionOutcome::success()
            }
            Err(err) => {
                warn!(
                    component = "dispatcher",
                    event = "dispatcher.action_failed",
                    session_id = %session_id,
                    action = action_name,
                    error = %err,
                    "Action failed"
                );
                ActionOutcome::failure(err.to_string())
            }
        };

        self.store.announce(ServerMessage::ActionCompleted {
            session_id,
            action: action_name.to_string(),
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn deliver(&self, message: &ClientMessage) -> Result<Decision, DispatchError> {
        let view = self
            .store
            .session(message.session_id())
            .ok_or_else(|| DispatchError::UnknownSession(message.session_id().to_string()))?;

        let (action, decision) = match message {
            ClientMessage::ApproveTool { mode, .. } => {
                require_approval(&view)?;
                (Action::Approve(*mode), Decision::Approved { mode: *mode })
            }
            ClientMessage::DenyTool { message, .. } => {
                require_approval(&view)?;
                (
                    Action::Reject(message.as_deref()),
                    Decision::Denied {
                        message: message.clone(),
                    },
                )
            }
            ClientMessage::SendMessage { content, .. } => {
                (Action::SendText(content), Decision::MessageSent)
            }
        };

        if view.is_editor_backed() {
            match self.via_editor(&view, action).await {
                Ok(()) => return Ok(decision),
                Err(DispatchError::Resolve(ResolveError::NoTarget { .. })) => {
                    info!(
                        component = "dispatcher",
                        event = "dispatcher.editor_fallback",
                        session_id = %view.id,
                        "No editor instance; falling back to the tmux pane"
                    );
                }
                Err(err) => {
                    self.editors.invalidate(&view.id);
                    return Err(err);
                }
            }
        }

        self.via_pane(&view, action).await?;
        Ok(decision)
    }

    async fn via_editor(&self, view: &SessionView, action: Action<'_>) -> Result<(), DispatchError> {
        let query = EditorQuery {
            session_id: &view.id,
            cwd: non_empty(&view.cwd),
            editor_pid: view.editor_pid,
        };
        let instance = self.editors.resolve(&query).await?;
        let (name, payload) = action.rpc();
        self.rpc.call(&view.id, &instance, name, payload).await?;
        Ok(())
    }

    async fn via_pane(&self, view: &SessionView, action: Action<'_>) -> Result<(), DispatchError> {
        let query = PaneQuery {
            session_id: &view.id,
            pane_id: view.tmux_pane.as_deref(),
            pid: view.pid,
            cwd: non_empty(&view.cwd),
        };
        let resolved = self.tmux.resolve(&query, &self.processes).await?;
        let target: &PaneTarget = &resolved.pane.target;
        match action {
            Action::Approve(mode) => self.tmux.approve(target, mode).await,
            Action::Reject(message) => self.tmux.reject(target, message).await,
            Action::SendText(text) => self.tmux.send_text(target, text).await,
        }
    }
}

fn require_approval(view: &SessionView) -> Result<(), DispatchError> {
    match view.phase {
        SessionPhase::WaitingForApproval(_) => Ok(()),
        _ => Err(DispatchError::NotAwaitingApproval {
            session_id: view.id.clone(),
        }),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use panedock_protocol::{EditorConnection, HookEvent};

    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::services::testing::{test_bed, TestBed};
    use crate::session::EditorLink;

    const PS: &str = "1 0 init\n50 1 tmux\n60 50 zsh\n70 60 claude\n";
    const PANES: &str = "%3\tmain:1.0\t60\t/repo\n";

    struct Harness {
        store: SessionStore,
        runner: Arc<ScriptedRunner>,
        dispatcher: Dispatcher,
        _bed: TestBed,
    }

    fn harness(runner: ScriptedRunner, registry: Option<&str>) -> Harness {
        let bed = test_bed(runner, registry);
        Harness {
            store: bed.store.clone(),
            runner: bed.runner.clone(),
            dispatcher: Dispatcher::new(bed.store.clone(), &bed.services),
            _bed: bed,
        }
    }

    fn base_runner() -> ScriptedRunner {
        ScriptedRunner::new()
            .on(&["ps"], PS)
            .on(&["tmux", "list-panes", "-a"], PANES)
            .on(&["tmux", "send-keys"], "")
    }

    async fn seed(store: &SessionStore, event_name: &str, status: &str) {
        let sink = store.sink();
        sink.submit(
            "s1",
            Input::Lifecycle(HookEvent {
                session_id: "s1".into(),
                event_name: event_name.into(),
                status: Some(status.into()),
                tool: Some("Bash".into()),
                tool_use_id: Some("t1".into()),
                pid: Some(70),
                cwd: Some("/repo".into()),
                ..Default::default()
            }),
        )
        .await;
        sink.barrier().await;
    }

    async fn link_editor(store: &SessionStore) {
        let sink = store.sink();
        sink.submit(
            "s1",
            Input::EditorStatus {
                status: EditorConnection::Connected,
                editor: Some(EditorLink {
                    pid: 900,
                    endpoint: None,
                }),
            },
        )
        .await;
        sink.barrier().await;
    }

    fn approve() -> ClientMessage {
        ClientMessage::ApproveTool {
            session_id: "s1".into(),
            mode: ApprovalMode::Always,
        }
    }

    fn send_keys(runner: &ScriptedRunner) -> Vec<Vec<String>> {
        runner.calls_starting_with(&["tmux", "send-keys"])
    }

    #[tokio::test]
    async fn approval_goes_to_resolved_pane_and_updates_phase() {
        let h = harness(base_runner(), None);
        seed(&h.store, "PermissionRequest", "waiting_for_approval").await;

        let outcome = h.dispatcher.dispatch(approve()).await;
        assert_eq!(outcome, ActionOutcome::success());

        let calls = send_keys(&h.runner);
        assert_eq!(calls[0], ["tmux", "send-keys", "-t", "main:1.0", "-l", "--", "2"]);
        assert_eq!(calls[1], ["tmux", "send-keys", "-t", "main:1.0", "Enter"]);

        h.store.sink().barrier().await;
        assert_eq!(h.store.session("s1").unwrap().phase, SessionPhase::Processing);
    }

    #[tokio::test]
    async fn approval_without_pending_request_is_refused() {
        let h = harness(base_runner(), None);
        seed(&h.store, "Stop", "waiting_for_input").await;

        let outcome = h.dispatcher.dispatch(approve()).await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("not waiting for approval"));
        assert!(send_keys(&h.runner).is_empty());
        assert_eq!(
            h.store.session("s1").unwrap().phase,
            SessionPhase::WaitingForInput
        );
    }

    #[tokio::test]
    async fn unknown_session_fails_cleanly() {
        let h = harness(base_runner(), None);
        let outcome = h
            .dispatcher
            .dispatch(ClientMessage::SendMessage {
                session_id: "nope".into(),
                content: "hi".into(),
            })
            .await;
        assert!(!outcome.ok);
    }

    #[tokio::test]
    async fn editor_backed_session_uses_bridge() {
        let runner = base_runner().on(&["bridge"], r#"{"trace_id":"t","ok":true}"#);
        let registry = r#"{"instances":[{"pid":900,"endpoint":"/tmp/nvim.900.0","cwd":"/repo"}]}"#;
        let h = harness(runner, Some(registry));
        seed(&h.store, "Stop", "waiting_for_input").await;
        link_editor(&h.store).await;

        let outcome = h
            .dispatcher
            .dispatch(ClientMessage::SendMessage {
                session_id: "s1".into(),
                content: "run the tests".into(),
            })
            .await;
        assert!(outcome.ok, "{outcome:?}");

        let bridge = h.runner.calls_starting_with(&["bridge"]);
        assert_eq!(bridge.len(), 1);
        assert_eq!(bridge[0], ["bridge", "--server", "/tmp/nvim.900.0"]);
        assert!(send_keys(&h.runner).is_empty());
    }

    #[tokio::test]
    async fn editor_without_instance_falls_back_to_pane() {
        let h = harness(base_runner(), None);
        seed(&h.store, "PermissionRequest", "waiting_for_approval").await;
        link_editor(&h.store).await;

        let outcome = h
            .dispatcher
            .dispatch(ClientMessage::DenyTool {
                session_id: "s1".into(),
                message: Some("use rg".into()),
            })
            .await;
        assert!(outcome.ok, "{outcome:?}");

        let typed: Vec<String> = send_keys(&h.runner)
            .into_iter()
            .filter(|argv| argv.contains(&"-l".to_string()))
            .map(|argv| argv[argv.len() - 1].clone())
            .collect();
        assert_eq!(typed, vec!["n", "use rg"]);
        assert!(h.runner.calls_starting_with(&["bridge"]).is_empty());
    }

    #[tokio::test]
    async fn bridge_rejection_reports_failure() {
        let runner = base_runner().on(&["bridge"], r#"{"trace_id":"t","ok":false,"error":"no prompt"}"#);
        let registry = r#"{"instances":[{"pid":900,"endpoint":"/tmp/nvim.900.0","cwd":"/repo"}]}"#;
        let h = harness(runner, Some(registry));
        seed(&h.store, "PermissionRequest", "waiting_for_approval").await;
        link_editor(&h.store).await;

        let outcome = h.dispatcher.dispatch(approve()).await;
        assert!(!outcome.ok);
        assert!(send_keys(&h.runner).is_empty());
        assert!(matches!(
            h.store.session("s1").unwrap().phase,
            SessionPhase::WaitingForApproval(_)
        ));
    }
}
