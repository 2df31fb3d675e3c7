//! Errors shared by the resolvers and the dispatcher.

use std::path::PathBuf;

use thiserror::Error;

use crate::command::CommandError;
use crate::editor::rpc::RpcError;

/// Target discovery failures.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Every strategy ran and none produced a live target.
    #[error("no {kind} target found for session {session_id}")]
    NoTarget {
        kind: &'static str,
        session_id: String,
    },

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Failures while delivering a user action.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown session {0}")]
    UnknownSession(String),

    #[error("session {session_id} is not waiting for approval")]
    NotAwaitingApproval { session_id: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("{program} rejected the input: {stderr}")]
    Rejected { program: String, stderr: String },
}

/// File watcher failures. Never fatal; the watcher logs and retries on the next wake.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}
