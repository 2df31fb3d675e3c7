//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::SessionView;

/// Messages broadcast by the daemon to UI clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Full state sync
    SessionsList { sessions: Vec<SessionView> },

    // Incremental updates
    SessionUpdated { session: Box<SessionView> },

    // Lifecycle
    SessionRemoved { session_id: String, reason: String },

    // Actions
    ActionCompleted {
        session_id: String,
        action: String,
        outcome: ActionOutcome,
    },

    Error { code: String, message: String },
}

/// Per-action result reported back to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}
