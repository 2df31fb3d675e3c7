//! Periodic editor connectivity checks.
//!
//! Each round marks every editor-backed session `Checking`, then pings the
//! bridge for each one in parallel (bounded). Results flow back through the
//! store like any other input; nothing here touches session state.

use std::sync::Arc;
use std::time::Duration;

use panedock_protocol::{EditorConnection, EditorInstance, SessionView};
use serde_json::json;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::editor::{EditorQuery, EditorResolver, EditorRpc};
use crate::services::Services;
use crate::session::EditorLink;
use crate::session_store::SessionStore;
use crate::transition::Input;

pub struct HealthChecker {
    store: SessionStore,
    editors: Arc<EditorResolver>,
    rpc: Arc<EditorRpc>,
    interval: Duration,
    concurrency: usize,
}

impl HealthChecker {
    pub fn new(store: SessionStore, services: &Services, interval: Duration, concurrency: usize) -> Self {
        Self {
            store,
            editors: services.editors.clone(),
            rpc: services.rpc.clone(),
            interval,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(
            component = "health",
            event = "health.stopped",
            "Health checker stopped"
        );
    }

    /// One round. Returns how many sessions were checked.
    pub async fn check_once(&self) -> usize {
        let snapshot = self.store.snapshot();
        let candidates: Vec<Arc<SessionView>> = snapshot
            .sessions()
            .filter(|v| v.is_editor_backed() && !v.phase.is_ended())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        let sink = self.store.sink();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut checks = JoinSet::new();

        for view in candidates.iter().cloned() {
            sink.submit(
                &view.id,
                Input::EditorStatus {
                    status: EditorConnection::Checking,
                    editor: None,
                },
            )
            .await;

            let permits = permits.clone();
            let editors = self.editors.clone();
            let rpc = self.rpc.clone();
            let sink = sink.clone();
            checks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                let input = match ping(&editors, &rpc, &view).await {
                    Ok(instance) => Input::EditorStatus {
                        status: EditorConnection::Connected,
                        editor: Some(EditorLink {
                            pid: instance.pid,
                            endpoint: Some(instance.endpoint),
                        }),
                    },
                    Err(err) => {
                        debug!(
                            component = "health",
                            event = "health.ping_failed",
                            session_id = %view.id,
                            error = %err,
                            "Editor unreachable"
                        );
                        editors.invalidate(&view.id);
                        Input::EditorStatus {
                            status: EditorConnection::Disconnected,
                            editor: None,
                        }
                    }
                };
                sink.submit(view.id.clone(), input).await;
            });
        }

        while let Some(joined) = checks.join_next().await {
            if let Err(err) = joined {
                warn!(
                    component = "health",
                    event = "health.check_panicked",
                    error = %err,
                    "Health check task failed"
                );
            }
        }

        info!(
            component = "health",
            event = "health.round_complete",
            checked = candidates.len(),
            "Editor health round complete"
        );
        candidates.len()
    }
}

async fn ping(
    editors: &EditorResolver,
    rpc: &EditorRpc,
    view: &SessionView,
) -> anyhow::Result<EditorInstance> {
    let query = EditorQuery {
        session_id: &view.id,
        cwd: (!view.cwd.is_empty()).then_some(view.cwd.as_str()),
        editor_pid: view.editor_pid,
    };
    let instance = editors.resolve(&query).await?;
    rpc.call(&view.id, &instance, "ping", json!({})).await?;
    Ok(instance)
}
