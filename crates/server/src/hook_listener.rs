//! Lifecycle ingress: newline-delimited hook JSON over a unix socket.
//!
//! The HTTP `/api/hook` route feeds the same [`HookIngress`], so both
//! transports share decoding, logging and editor detection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use panedock_protocol::{EditorConnection, HookEvent};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::editor::is_editor_process;
use crate::process_tree::ProcessSnapshotter;
use crate::session::EditorLink;
use crate::session_command::EventSink;
use crate::transition::Input;

/// Finds an editor process above a session's agent process, once per session.
pub struct EditorAncestorDetector {
    snapshotter: Arc<ProcessSnapshotter>,
    editor_name: String,
    checked: DashSet<String>,
}

impl EditorAncestorDetector {
    pub fn new(snapshotter: Arc<ProcessSnapshotter>, editor_name: impl Into<String>) -> Self {
        Self {
            snapshotter,
            editor_name: editor_name.into(),
            checked: DashSet::new(),
        }
    }

    /// `None` when already checked for this session or no editor ancestor exists.
    pub async fn detect(&self, session_id: &str, pid: u32) -> Option<EditorLink> {
        if !self.checked.insert(session_id.to_string()) {
            return None;
        }
        let tree = match self.snapshotter.snapshot().await {
            Ok(tree) => tree,
            Err(err) => {
                warn!(
                    component = "hook_listener",
                    event = "hook_listener.process_snapshot_failed",
                    session_id = %session_id,
                    error = %err,
                    "Editor ancestor check skipped"
                );
                // allow a retry on the next event
                self.checked.remove(session_id);
                return None;
            }
        };
        let editor_pid =
            tree.find_ancestor_named(pid, |name| is_editor_process(name, &self.editor_name))?;
        info!(
            component = "hook_listener",
            event = "hook_listener.editor_detected",
            session_id = %session_id,
            pid,
            editor_pid,
            "Session runs inside an editor terminal"
        );
        Some(EditorLink {
            pid: editor_pid,
            endpoint: None,
        })
    }
}

/// Decodes hook payloads and submits them to the store.
#[derive(Clone)]
pub struct HookIngress {
    sink: EventSink,
    detector: Arc<EditorAncestorDetector>,
}

impl HookIngress {
    pub fn new(sink: EventSink, detector: Arc<EditorAncestorDetector>) -> Self {
        Self { sink, detector }
    }

    /// Returns false for a malformed line, which is logged and skipped.
    pub async fn accept_line(&self, line: &str) -> bool {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => self.accept_value(&value).await,
            Err(err) => {
                warn!(
                    component = "hook_listener",
                    event = "hook_listener.malformed_line",
                    error = %err,
                    bytes = line.len(),
                    "Skipping malformed hook line"
                );
                false
            }
        }
    }

    pub async fn accept_value(&self, value: &Value) -> bool {
        let Some(event) = HookEvent::from_value(value) else {
            warn!(
                component = "hook_listener",
                event = "hook_listener.missing_session_id",
                "Skipping hook event without session_id"
            );
            return false;
        };
        self.accept(event).await;
        true
    }

    pub async fn accept(&self, event: HookEvent) {
        debug!(
            component = "hook_listener",
            event = "hook_listener.event_received",
            session_id = %event.session_id,
            hook = %event.event_name,
            "Hook event received"
        );
        let session_id = event.session_id.clone();
        let pid = event.pid;
        self.sink.submit(&session_id, Input::Lifecycle(event)).await;

        if let Some(pid) = pid {
            if let Some(link) = self.detector.detect(&session_id, pid).await {
                self.sink
                    .submit(
                        session_id,
                        Input::EditorStatus {
                            status: EditorConnection::Unknown,
                            editor: Some(link),
                        },
                    )
                    .await;
            }
        }
    }
}

/// Bind the socket, replacing a stale file from a previous run.
pub fn bind_socket(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

pub async fn serve_socket(
    listener: UnixListener,
    path: PathBuf,
    ingress: HookIngress,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        component = "hook_listener",
        event = "hook_listener.listening",
        path = %path.display(),
        "Hook socket listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let ingress = ingress.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, ingress).await;
                    });
                }
                Err(err) => warn!(
                    component = "hook_listener",
                    event = "hook_listener.accept_failed",
                    error = %err,
                    "Failed to accept hook connection"
                ),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    let _ = std::fs::remove_file(&path);
    info!(
        component = "hook_listener",
        event = "hook_listener.stopped",
        "Hook socket closed"
    );
}

async fn handle_connection(stream: UnixStream, ingress: HookIngress) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    ingress.accept_line(line).await;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(
                    component = "hook_listener",
                    event = "hook_listener.read_failed",
                    error = %err,
                    "Hook connection read failed"
                );
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::session_command::StoreCommand;

    const PS: &str = "1 0 launchd\n100 1 nvim\n110 100 zsh\n120 110 claude\n200 1 zsh\n210 200 claude\n";

    fn detector() -> Arc<EditorAncestorDetector> {
        let runner = Arc::new(ScriptedRunner::new().on(&["ps"], PS));
        let snapshotter = Arc::new(ProcessSnapshotter::new(
            runner,
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        Arc::new(EditorAncestorDetector::new(snapshotter, "nvim"))
    }

    async fn next_apply(rx: &mut mpsc::Receiver<StoreCommand>) -> (String, Input) {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            StoreCommand::Apply { session_id, input } => (session_id, input),
            _ => panic!("expected apply"),
        }
    }

    #[tokio::test]
    async fn detects_editor_once_per_session() {
        let detector = detector();
        assert_eq!(
            detector.detect("s1", 120).await,
            Some(EditorLink {
                pid: 100,
                endpoint: None
            })
        );
        assert_eq!(detector.detect("s1", 120).await, None);
        assert_eq!(detector.detect("s2", 210).await, None);
    }

    #[tokio::test]
    async fn ingress_submits_lifecycle_then_editor_link() {
        let (sink, mut rx) = EventSink::channel(16);
        let ingress = HookIngress::new(sink, detector());

        assert!(!ingress.accept_line("{not json").await);
        assert!(!ingress.accept_line(r#"{"event_name":"Stop"}"#).await);
        assert!(
            ingress
                .accept_line(r#"{"session_id":"s1","event":"SessionStart","pid":120,"cwd":"/w"}"#)
                .await
        );

        let (id, input) = next_apply(&mut rx).await;
        assert_eq!(id, "s1");
        assert!(matches!(input, Input::Lifecycle(ref e) if e.event_name == "SessionStart"));
        let (_, input) = next_apply(&mut rx).await;
        assert_eq!(
            input,
            Input::EditorStatus {
                status: EditorConnection::Unknown,
                editor: Some(EditorLink {
                    pid: 100,
                    endpoint: None
                }),
            }
        );
    }

    #[tokio::test]
    async fn socket_accepts_multiple_lines_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panedock.sock");
        std::fs::write(&path, "stale").unwrap();
        let listener = bind_socket(&path).unwrap();

        let (sink, mut rx) = EventSink::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(serve_socket(
            listener,
            path.clone(),
            HookIngress::new(sink, detector()),
            stop_rx,
        ));

        let mut client = UnixStream::connect(&path).await.unwrap();
        client
            .write_all(
                b"{\"session_id\":\"a\",\"event_name\":\"Stop\"}\ngarbage\n\n{\"session_id\":\"b\",\"event_name\":\"Stop\"}\n",
            )
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(next_apply(&mut rx).await.0, "a");
        assert_eq!(next_apply(&mut rx).await.0, "b");

        stop_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(!path.exists());
    }
}
