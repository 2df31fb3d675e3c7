//! Session store actor: the only writer of session state.
//!
//! Every producer submits `StoreCommand`s through an [`EventSink`]. The actor
//! applies them one at a time through [`transition`], runs the returned
//! effects, then publishes a fresh [`StoreSnapshot`] for lock-free readers
//! and broadcasts a `ServerMessage` for subscribers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use panedock_protocol::{now_ms, ServerMessage, SessionView};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::CoreConfig;
use crate::paths::Paths;
use crate::session::Session;
use crate::session_command::{EventSink, StoreCommand};
use crate::transcript_watcher::WatcherSupervisor;
use crate::transition::{transition, Effect, Input, Rules};

/// Immutable view of every live session, ordered by id.
#[derive(Debug, Default)]
pub struct StoreSnapshot {
    sessions: BTreeMap<String, Arc<SessionView>>,
}

impl StoreSnapshot {
    pub fn get(&self, session_id: &str) -> Option<&Arc<SessionView>> {
        self.sessions.get(session_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Arc<SessionView>> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn to_list(&self) -> Vec<SessionView> {
        self.sessions.values().map(|v| v.as_ref().clone()).collect()
    }
}

/// Handle to the running store (cheap to Clone).
#[derive(Clone)]
pub struct SessionStore {
    sink: EventSink,
    snapshot: Arc<ArcSwap<StoreSnapshot>>,
    updates: broadcast::Sender<ServerMessage>,
}

impl SessionStore {
    pub fn spawn(config: &CoreConfig, paths: Paths) -> (SessionStore, JoinHandle<()>) {
        let (sink, command_rx) = EventSink::channel(config.event_queue_capacity);
        let (updates, _) = broadcast::channel(config.broadcast_capacity);
        let snapshot = Arc::new(ArcSwap::from_pointee(StoreSnapshot::default()));

        let actor = StoreActor {
            sessions: HashMap::new(),
            views: BTreeMap::new(),
            watchers: WatcherSupervisor::new(sink.clone(), paths, config.watch_poll_interval),
            rules: Rules {
                stale_strike_limit: config.stale_strike_limit,
            },
            snapshot: snapshot.clone(),
            updates: updates.clone(),
        };
        let task = tokio::spawn(actor.run(command_rx));

        (
            SessionStore {
                sink,
                snapshot,
                updates,
            },
            task,
        )
    }

    pub fn sink(&self) -> EventSink {
        self.sink.clone()
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.snapshot.load_full()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<SessionView>> {
        self.snapshot.load().get(session_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.updates.subscribe()
    }

    /// Fan a message out to subscribers. Dropped silently when nobody listens.
    pub fn announce(&self, message: ServerMessage) {
        let _ = self.updates.send(message);
    }
}

struct StoreActor {
    sessions: HashMap<String, Session>,
    views: BTreeMap<String, Arc<SessionView>>,
    watchers: WatcherSupervisor,
    rules: Rules,
    snapshot: Arc<ArcSwap<StoreSnapshot>>,
    updates: broadcast::Sender<ServerMessage>,
}

impl StoreActor {
    async fn run(mut self, mut command_rx: mpsc::Receiver<StoreCommand>) {
        info!(
            component = "session_store",
            event = "session_store.started",
            "Session store started"
        );

        while let Some(cmd) = command_rx.recv().await {
            match cmd {
                StoreCommand::Apply { session_id, input } => self.apply(session_id, input),
                StoreCommand::Barrier { reply } => {
                    let _ = reply.send(());
                }
                StoreCommand::Shutdown => break,
            }
        }

        self.watchers.shutdown();
        info!(
            component = "session_store",
            event = "session_store.stopped",
            sessions = self.sessions.len(),
            "Session store stopped"
        );
    }

    fn apply(&mut self, session_id: String, input: Input) {
        let now = now_ms();
        let label = input.label();

        let current = match self.sessions.remove(&session_id) {
            Some(session) => session,
            None if input.creates_session() => {
                info!(
                    component = "session_store",
                    event = "session_store.session_created",
                    session_id = %session_id,
                    input = label,
                    "Tracking new session"
                );
                Session::new(&session_id, now)
            }
            None => {
                debug!(
                    component = "session_store",
                    event = "session_store.input_for_unknown_session",
                    session_id = %session_id,
                    input = label,
                    "Ignoring input for unknown session"
                );
                return;
            }
        };

        let previous_phase = current.phase.label();
        let (next, effects) = transition(current, input, now, &self.rules);
        if next.phase.label() != previous_phase {
            debug!(
                component = "session_store",
                event = "session_store.phase_changed",
                session_id = %session_id,
                from = previous_phase,
                to = next.phase.label(),
                input = label,
                "Session phase changed"
            );
        }
        self.sessions.insert(session_id.clone(), next);

        let mut removed = None;
        for effect in effects {
            match effect {
                Effect::EnsureTranscriptWatch {
                    cwd,
                    transcript_path,
                } => {
                    self.watchers
                        .ensure_session(&session_id, &cwd, transcript_path.as_deref());
                }
                Effect::StartSubagentWatcher {
                    task_tool_use_id,
                    agent_id,
                } => {
                    self.watchers
                        .start_subagent(&session_id, &task_tool_use_id, &agent_id);
                }
                Effect::StopSubagentWatcher { task_tool_use_id } => {
                    self.watchers.stop_subagent(&session_id, &task_tool_use_id);
                }
                Effect::LoadSubagentTranscript {
                    task_tool_use_id,
                    agent_id,
                } => {
                    self.watchers
                        .load_subagent(&session_id, &task_tool_use_id, &agent_id);
                }
                Effect::Remove { reason } => removed = Some(reason),
            }
        }

        match removed {
            Some(reason) => self.remove(&session_id, reason),
            None => self.publish_session(&session_id),
        }
    }

    fn remove(&mut self, session_id: &str, reason: String) {
        self.sessions.remove(session_id);
        self.views.remove(session_id);
        self.watchers.stop_session(session_id);
        info!(
            component = "session_store",
            event = "session_store.session_removed",
            session_id = %session_id,
            reason = %reason,
            "Session removed"
        );
        self.publish_snapshot();
        let _ = self.updates.send(ServerMessage::SessionRemoved {
            session_id: session_id.to_string(),
            reason,
        });
    }

    fn publish_session(&mut self, session_id: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let view = Arc::new(session.view());
        self.views.insert(session_id.to_string(), view.clone());
        self.publish_snapshot();
        let _ = self.updates.send(ServerMessage::SessionUpdated {
            session: Box::new(view.as_ref().clone()),
        });
    }

    fn publish_snapshot(&self) {
        self.snapshot.store(Arc::new(StoreSnapshot {
            sessions: self.views.clone(),
        }));
    }
}
