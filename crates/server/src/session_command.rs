//! Commands sent to the session store actor.

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::transition::Input;

pub enum StoreCommand {
    /// Apply one input to one session.
    Apply { session_id: String, input: Input },

    /// Reply once every command queued before this one has been applied.
    Barrier { reply: oneshot::Sender<()> },

    /// Stop all watchers and exit the actor loop.
    Shutdown,
}

/// Cheap, cloneable submit side of the store channel.
///
/// Producers (ingress, watchers, health checker, sweeper, dispatcher) hold
/// one of these; they never see session state directly.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StoreCommand>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StoreCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue an input. Applied in submission order.
    pub async fn submit(&self, session_id: impl Into<String>, input: Input) {
        let session_id = session_id.into();
        let label = input.label();
        if self
            .tx
            .send(StoreCommand::Apply {
                session_id: session_id.clone(),
                input,
            })
            .await
            .is_err()
        {
            warn!(
                component = "session_store",
                event = "session_store.submit_dropped",
                session_id = %session_id,
                input = label,
                "Store channel closed, input dropped"
            );
        }
    }

    /// Wait until everything submitted so far has been applied.
    pub async fn barrier(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(StoreCommand::Barrier { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(StoreCommand::Shutdown).await;
    }
}
