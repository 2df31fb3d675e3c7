//! Stale session sweeper.
//!
//! Flags editor-backed sessions whose editor is unreachable and whose
//! processes are gone. Flagging only submits a `StaleCandidate`; the store
//! counts consecutive strikes and decides when to remove.

use std::sync::Arc;
use std::time::Duration;

use panedock_protocol::{now_ms, EditorConnection, SessionView};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::process_tree::{ProcessSnapshotter, ProcessTree};
use crate::session_store::SessionStore;
use crate::transition::Input;

pub struct StaleSweeper {
    store: SessionStore,
    processes: Arc<ProcessSnapshotter>,
    interval: Duration,
    threshold: Duration,
}

impl StaleSweeper {
    pub fn new(
        store: SessionStore,
        processes: Arc<ProcessSnapshotter>,
        interval: Duration,
        threshold: Duration,
    ) -> Self {
        Self {
            store,
            processes,
            interval,
            threshold,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; skip it so a fresh daemon sees activity first
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(
            component = "sweeper",
            event = "sweeper.stopped",
            "Stale sweeper stopped"
        );
    }

    /// One pass. Returns how many candidates were submitted.
    pub async fn sweep_once(&self) -> usize {
        let tree = match self.processes.fresh().await {
            Ok(tree) => tree,
            Err(err) => {
                warn!(
                    component = "sweeper",
                    event = "sweeper.snapshot_failed",
                    error = %err,
                    "Skipping sweep without a process snapshot"
                );
                return 0;
            }
        };
        // a failed `ps` parses to nothing, and then every pid looks dead
        if tree.is_empty() {
            warn!(
                component = "sweeper",
                event = "sweeper.snapshot_empty",
                "Skipping sweep on an empty process snapshot"
            );
            return 0;
        }

        let evaluated_at_ms = now_ms();
        let threshold_ms = self.threshold.as_millis() as u64;
        let snapshot = self.store.snapshot();
        let candidates: Vec<&Arc<SessionView>> = snapshot
            .sessions()
            .filter(|view| is_candidate(view, &tree))
            .collect();

        let sink = self.store.sink();
        for view in &candidates {
            sink.submit(
                &view.id,
                Input::StaleCandidate {
                    evaluated_at_ms,
                    threshold_ms,
                },
            )
            .await;
        }

        if !candidates.is_empty() {
            info!(
                component = "sweeper",
                event = "sweeper.candidates",
                count = candidates.len(),
                "Submitted stale candidates"
            );
        }
        candidates.len()
    }
}

/// Disconnected editor session with no live backing process.
fn is_candidate(view: &SessionView, tree: &ProcessTree) -> bool {
    if view.editor_status != EditorConnection::Disconnected {
        return false;
    }
    let Some(editor_pid) = view.editor_pid else {
        return false;
    };
    !tree.is_alive(editor_pid) && !view.pid.is_some_and(|pid| tree.is_alive(pid))
}
