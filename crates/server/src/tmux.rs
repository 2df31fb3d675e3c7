//! tmux pane resolution and keystroke injection.
//!
//! Resolution order, first match wins:
//! 1. exact pane id (`%3`) from the hook environment
//! 2. the session PID is a pane's shell PID or runs below it
//! 3. exact working-directory match against `-a` listing
//! 4. per-session listing across every tmux session, cwd match

use std::sync::Arc;
use std::time::Duration;

use panedock_protocol::{ApprovalMode, PaneTarget};
use tracing::{debug, info};

use crate::command::{CommandRunner, Invocation};
use crate::error::{DispatchError, ResolveError};
use crate::process_tree::{ProcessSnapshotter, ProcessTree};

// Tab-separated: session names and paths may contain spaces.
const PANE_FORMAT: &str =
    "#{pane_id}\t#{session_name}:#{window_index}.#{pane_index}\t#{pane_pid}\t#{pane_current_path}";

/// One row of `list-panes` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaneInfo {
    pub pane_id: Option<String>,
    pub target: PaneTarget,
    pub pid: Option<u32>,
    pub current_path: Option<String>,
}

/// Which strategy produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneStrategy {
    PaneId,
    ProcessAncestry,
    WorkingDirectory,
    SessionScan,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPane {
    pub pane: PaneInfo,
    pub strategy: PaneStrategy,
}

/// Identity signals known for a session.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaneQuery<'a> {
    pub session_id: &'a str,
    pub pane_id: Option<&'a str>,
    pub pid: Option<u32>,
    pub cwd: Option<&'a str>,
}

/// Parse one listing line: `[%id]\tsession:w.p[\tpid[\tpath]]`.
pub fn parse_pane_line(line: &str) -> Option<PaneInfo> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    let mut fields = line.split('\t');
    let mut first = fields.next()?.trim();
    let pane_id = if first.starts_with('%') {
        let id = first.to_string();
        first = fields.next()?.trim();
        Some(id)
    } else {
        None
    };
    let target: PaneTarget = first.parse().ok()?;
    let pid = fields.next().and_then(|f| f.trim().parse::<u32>().ok());
    let path = fields.collect::<Vec<_>>().join("\t");

    Some(PaneInfo {
        pane_id,
        target,
        pid,
        current_path: (!path.trim().is_empty()).then(|| path.to_string()),
    })
}

pub fn parse_pane_listing(output: &str) -> Vec<PaneInfo> {
    output.lines().filter_map(parse_pane_line).collect()
}

/// Strategies 1–3 against an `-a` listing. Pure, so it can be tested without tmux.
pub fn match_listing(
    panes: &[PaneInfo],
    query: &PaneQuery<'_>,
    tree: Option<&ProcessTree>,
) -> Option<ResolvedPane> {
    if let Some(pane_id) = query.pane_id {
        if let Some(pane) = panes.iter().find(|p| p.pane_id.as_deref() == Some(pane_id)) {
            return Some(ResolvedPane {
                pane: pane.clone(),
                strategy: PaneStrategy::PaneId,
            });
        }
    }

    if let Some(pid) = query.pid {
        let owned = panes.iter().find(|p| match p.pid {
            Some(pane_pid) if pane_pid == pid => true,
            Some(pane_pid) => tree.is_some_and(|t| t.is_descendant(pid, pane_pid)),
            None => false,
        });
        if let Some(pane) = owned {
            return Some(ResolvedPane {
                pane: pane.clone(),
                strategy: PaneStrategy::ProcessAncestry,
            });
        }
    }

    if let Some(cwd) = query.cwd {
        if let Some(pane) = panes
            .iter()
            .find(|p| p.current_path.as_deref() == Some(cwd))
        {
            return Some(ResolvedPane {
                pane: pane.clone(),
                strategy: PaneStrategy::WorkingDirectory,
            });
        }
    }

    None
}

/// Client for the tmux CLI
pub struct TmuxClient {
    runner: Arc<dyn CommandRunner>,
    tmux_path: String,
    timeout: Duration,
    settle_delay: Duration,
    reject_message_delay: Duration,
}

impl TmuxClient {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        tmux_path: impl Into<String>,
        timeout: Duration,
        settle_delay: Duration,
        reject_message_delay: Duration,
    ) -> Self {
        Self {
            runner,
            tmux_path: tmux_path.into(),
            timeout,
            settle_delay,
            reject_message_delay,
        }
    }

    fn invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation::new(&self.tmux_path)
            .args(args)
            .timeout(self.timeout)
    }

    /// Run tmux and return stdout. "No server" is reported as empty output.
    async fn run(&self, invocation: Invocation) -> Result<String, DispatchError> {
        let output = self
            .runner
            .run(&invocation)
            .await
            .map_err(ResolveError::from)?;
        if output.success {
            return Ok(output.stdout);
        }
        let stderr = output.stderr.trim();
        if stderr.contains("no server running") || stderr.contains("no sessions") {
            return Ok(String::new());
        }
        Err(DispatchError::Rejected {
            program: self.tmux_path.clone(),
            stderr: stderr.to_string(),
        })
    }

    /// Every pane on the server.
    pub async fn list_all_panes(&self) -> Result<Vec<PaneInfo>, DispatchError> {
        let stdout = self
            .run(self.invocation(["list-panes", "-a", "-F", PANE_FORMAT]))
            .await?;
        Ok(parse_pane_listing(&stdout))
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>, DispatchError> {
        let stdout = self
            .run(self.invocation(["list-sessions", "-F", "#{session_name}"]))
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub async fn list_session_panes(&self, session: &str) -> Result<Vec<PaneInfo>, DispatchError> {
        let stdout = self
            .run(self.invocation(["list-panes", "-s", "-t", session, "-F", PANE_FORMAT]))
            .await?;
        Ok(parse_pane_listing(&stdout))
    }

    /// Resolve where keystrokes for a session should go.
    pub async fn resolve(
        &self,
        query: &PaneQuery<'_>,
        processes: &ProcessSnapshotter,
    ) -> Result<ResolvedPane, ResolveError> {
        let panes = match self.list_all_panes().await {
            Ok(panes) => panes,
            Err(err) => {
                debug!(
                    component = "tmux",
                    event = "tmux.list_all_failed",
                    session_id = %query.session_id,
                    error = %err,
                    "list-panes -a failed; falling back to per-session scan"
                );
                Vec::new()
            }
        };

        let tree = match query.pid {
            Some(_) => processes.snapshot().await.ok(),
            None => None,
        };

        if let Some(found) = match_listing(&panes, query, tree.as_deref()) {
            info!(
                component = "tmux",
                event = "tmux.pane_resolved",
                session_id = %query.session_id,
                target = %found.pane.target,
                strategy = ?found.strategy,
                "Resolved pane"
            );
            return Ok(found);
        }

        if let Some(cwd) = query.cwd {
            for session in self.list_sessions().await.unwrap_or_default() {
                let Ok(session_panes) = self.list_session_panes(&session).await else {
                    continue;
                };
                if let Some(pane) = session_panes
                    .into_iter()
                    .find(|p| p.current_path.as_deref() == Some(cwd))
                {
                    info!(
                        component = "tmux",
                        event = "tmux.pane_resolved",
                        session_id = %query.session_id,
                        target = %pane.target,
                        strategy = ?PaneStrategy::SessionScan,
                        "Resolved pane"
                    );
                    return Ok(ResolvedPane {
                        pane,
                        strategy: PaneStrategy::SessionScan,
                    });
                }
            }
        }

        Err(ResolveError::NoTarget {
            kind: "tmux pane",
            session_id: query.session_id.to_string(),
        })
    }

    /// Type `text` literally, then press Enter as a separate command.
    pub async fn send_text(&self, target: &PaneTarget, text: &str) -> Result<(), DispatchError> {
        let target = target.to_string();
        self.run(self.invocation(["send-keys", "-t", target.as_str(), "-l", "--", text]))
            .await?;
        tokio::time::sleep(self.settle_delay).await;
        self.run(self.invocation(["send-keys", "-t", target.as_str(), "Enter"]))
            .await?;
        Ok(())
    }

    pub async fn approve(&self, target: &PaneTarget, mode: ApprovalMode) -> Result<(), DispatchError> {
        self.send_text(target, mode.keystroke()).await
    }

    /// Answer "n"; a rejection message follows as a second submission.
    pub async fn reject(
        &self,
        target: &PaneTarget,
        message: Option<&str>,
    ) -> Result<(), DispatchError> {
        self.send_text(target, "n").await?;
        if let Some(message) = message.map(str::trim).filter(|m| !m.is_empty()) {
            tokio::time::sleep(self.reject_message_delay).await;
            self.send_text(target, message).await?;
        }
        Ok(())
    }
}
