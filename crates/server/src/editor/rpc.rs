//! Calls into a running editor through the external bridge executable.
//!
//! The bridge is invoked as `<bridge> --server <endpoint>`, reads one
//! [`RpcRequest`] JSON document on stdin and prints one [`RpcResponse`] on
//! stdout. It is killed if it outlives the timeout.

use std::sync::Arc;
use std::time::Duration;

use panedock_protocol::{new_id, now_ms, EditorInstance, RpcRequest, RpcResponse};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::command::{CommandError, CommandRunner, Invocation};

const REQUEST_SOURCE: &str = "panedock";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("editor bridge timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("failed to start editor bridge: {0}")]
    Spawn(String),

    #[error("editor bridge i/o failed: {0}")]
    Io(String),

    #[error("undecodable editor bridge response: {0}")]
    Decode(String),

    #[error("editor rejected {action}: {message}")]
    Rejected { action: String, message: String },
}

impl From<CommandError> for RpcError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::TimedOut { timeout_ms, .. } => RpcError::Timeout { timeout_ms },
            CommandError::Spawn { source, .. } => RpcError::Spawn(source.to_string()),
            CommandError::Io { source, .. } => RpcError::Io(source.to_string()),
        }
    }
}

pub struct EditorRpc {
    runner: Arc<dyn CommandRunner>,
    bridge_path: String,
    timeout: Duration,
}

impl EditorRpc {
    pub fn new(runner: Arc<dyn CommandRunner>, bridge_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            bridge_path: bridge_path.into(),
            timeout,
        }
    }

    pub fn request(session_id: &str, instance: &EditorInstance, action: &str, payload: Value) -> RpcRequest {
        RpcRequest {
            trace_id: new_id(),
            ts_ms: now_ms(),
            source: REQUEST_SOURCE.to_string(),
            session_id: session_id.to_string(),
            nvim_pid: instance.pid,
            action: action.to_string(),
            payload,
        }
    }

    /// Run one action. A response with `ok: false` is an error.
    pub async fn call(
        &self,
        session_id: &str,
        instance: &EditorInstance,
        action: &str,
        payload: Value,
    ) -> Result<RpcResponse, RpcError> {
        let request = Self::request(session_id, instance, action, payload);
        let body = serde_json::to_vec(&request).map_err(|e| RpcError::Decode(e.to_string()))?;

        let invocation = Invocation::new(&self.bridge_path)
            .args(["--server", instance.endpoint.as_str()])
            .stdin(body)
            .timeout(self.timeout);

        debug!(
            component = "editor_rpc",
            event = "editor_rpc.call",
            session_id = %session_id,
            trace_id = %request.trace_id,
            action = %action,
            nvim_pid = instance.pid,
            "Calling editor bridge"
        );

        let output = self.runner.run(&invocation).await?;
        let response = match decode_response(&output.stdout) {
            Ok(response) => response,
            // A failed bridge without a decodable body reports through stderr.
            Err(_) if !output.success => {
                let stderr = output.stderr.trim();
                return Err(RpcError::Rejected {
                    action: action.to_string(),
                    message: if stderr.is_empty() {
                        format!("bridge exited with {:?}", output.exit_code)
                    } else {
                        stderr.to_string()
                    },
                });
            }
            Err(err) => return Err(err),
        };

        if response.trace_id != request.trace_id {
            warn!(
                component = "editor_rpc",
                event = "editor_rpc.trace_mismatch",
                session_id = %session_id,
                expected = %request.trace_id,
                received = %response.trace_id,
                "Bridge answered with a different trace id"
            );
        }

        if !response.ok {
            return Err(RpcError::Rejected {
                action: action.to_string(),
                message: response
                    .error
                    .clone()
                    .unwrap_or_else(|| "unspecified error".to_string()),
            });
        }
        Ok(response)
    }
}

/// The last non-empty stdout line carries the response.
fn decode_response(stdout: &str) -> Result<RpcResponse, RpcError> {
    let line = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| RpcError::Decode("empty response".to_string()))?;
    serde_json::from_str(line).map_err(|e| RpcError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;

    use panedock_protocol::DiscoverySource;
    use serde_json::json;

    use super::*;
    use crate::command::testing::ScriptedRunner;
    use crate::command::SystemRunner;

    fn instance() -> EditorInstance {
        EditorInstance {
            pid: 4242,
            endpoint: "/tmp/nvim.me/0/nvim.4242.0".into(),
            cwd: Some("/repo".into()),
            source: DiscoverySource::Registry,
            checked_at_ms: 0,
        }
    }

    fn rpc(runner: Arc<dyn CommandRunner>, bridge: &str, timeout: Duration) -> EditorRpc {
        EditorRpc::new(runner, bridge, timeout)
    }

    #[tokio::test]
    async fn decodes_successful_response() {
        let runner = Arc::new(ScriptedRunner::new().on(
            &["bridge", "--server", "/tmp/nvim.me/0/nvim.4242.0"],
            "log noise\n{\"trace_id\":\"t\",\"ok\":true,\"data\":{\"pong\":true}}\n",
        ));
        let response = rpc(runner.clone(), "bridge", Duration::from_secs(1))
            .call("s1", &instance(), "ping", json!({}))
            .await
            .unwrap();
        assert_eq!(response.data, Some(json!({"pong": true})));
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn not_ok_is_rejected() {
        let runner = Arc::new(ScriptedRunner::new().on(
            &["bridge"],
            "{\"trace_id\":\"t\",\"ok\":false,\"error\":\"no terminal\"}",
        ));
        let err = rpc(runner, "bridge", Duration::from_secs(1))
            .call("s1", &instance(), "approve", json!({"mode": "once"}))
            .await
            .unwrap_err();
        match err {
            RpcError::Rejected { action, message } => {
                assert_eq!(action, "approve");
                assert_eq!(message, "no terminal");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_is_decode_error() {
        let runner = Arc::new(ScriptedRunner::new().on(&["bridge"], "definitely not json"));
        let err = rpc(runner, "bridge", Duration::from_secs(1))
            .call("s1", &instance(), "ping", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Decode(_)));
    }

    #[tokio::test]
    async fn missing_bridge_is_spawn_error() {
        let err = rpc(Arc::new(SystemRunner), "/no/such/bridge", Duration::from_secs(1))
            .call("s1", &instance(), "ping", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Spawn(_)));
    }

    #[tokio::test]
    async fn timeout_kills_the_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bridge.pid");
        let script = dir.path().join("bridge.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let started = Instant::now();
        let err = rpc(
            Arc::new(SystemRunner),
            script.to_str().unwrap(),
            Duration::from_millis(300),
        )
        .call("s1", &instance(), "ping", Value::Null)
        .await
        .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { timeout_ms: 300 }));
        assert!(started.elapsed() < Duration::from_secs(5));

        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        assert!(!alive, "bridge process {pid} survived the timeout");
    }
}
