//! `panedock send-hook` - forward one hook payload from stdin to the daemon.
//!
//! Meant to be configured as the agent's hook command. It adds the agent's
//! pid and tmux pane when the payload lacks them, and never fails the hook
//! just because the daemon is down.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;

use crate::paths::Paths;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(2);

pub fn run(paths: &Paths, event: Option<&str>) -> anyhow::Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("reading hook payload from stdin")?;

    // the hook runs as a direct child of the agent process
    let agent_pid = u32::try_from(unsafe { libc::getppid() }).ok();
    let line = enrich(&input, event, agent_pid, std::env::var("TMUX_PANE").ok())?;

    let socket = paths.socket_path();
    if let Err(err) = deliver(&socket, &line) {
        eprintln!(
            "panedock: daemon not reachable at {} ({err}); hook dropped",
            socket.display()
        );
    }
    Ok(())
}

fn enrich(
    input: &str,
    event: Option<&str>,
    agent_pid: Option<u32>,
    tmux_pane: Option<String>,
) -> anyhow::Result<String> {
    let mut value: Value = serde_json::from_str(input.trim()).context("hook payload is not JSON")?;
    let Some(obj) = value.as_object_mut() else {
        anyhow::bail!("hook payload must be a JSON object");
    };

    if let Some(event) = event {
        obj.insert("event_name".into(), Value::from(event));
    }
    if let Some(pid) = agent_pid.filter(|pid| *pid > 1) {
        obj.entry("pid").or_insert_with(|| Value::from(pid));
    }
    if let Some(pane) = tmux_pane.filter(|p| !p.is_empty()) {
        obj.entry("tmux_pane").or_insert_with(|| Value::from(pane));
    }

    let mut line = serde_json::to_string(&value)?;
    line.push('\n');
    Ok(line)
}

fn deliver(socket: &std::path::Path, line: &str) -> std::io::Result<()> {
    let mut stream = UnixStream::connect(socket)?;
    stream.set_write_timeout(Some(SOCKET_TIMEOUT))?;
    stream.write_all(line.as_bytes())?;
    stream.flush()
}
