//! PaneDock Protocol
//!
//! Shared types for communication between the PaneDock daemon, the agent
//! hook scripts that feed it, the editor bridge it calls, and UI clients.
//! Everything here is serialized as JSON.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod rpc;
pub mod server;
pub mod types;

pub use client::{ClientMessage, HookEvent};
pub use rpc::{RpcRequest, RpcResponse};
pub use server::{ActionOutcome, ServerMessage};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
