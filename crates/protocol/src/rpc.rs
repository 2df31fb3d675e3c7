//! Envelopes exchanged with the editor bridge executable

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request written to the bridge's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub trace_id: String,
    pub ts_ms: u64,
    pub source: String,
    pub session_id: String,
    pub nvim_pid: u32,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

/// Response the bridge prints on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub trace_id: String,
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}
