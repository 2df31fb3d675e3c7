//! Finds the editor instance hosting a session's terminal.
//!
//! Strategies, first live match wins:
//! 1. registry file entries (pane-annotated, unique cwd, sole entry)
//! 2. the editor PID already linked to the session
//! 3. every editor process whose cwd equals the session cwd
//! 4. tmux panes in the session cwd, searching each pane's process subtree
//!
//! Every candidate passes a liveness probe right before it is accepted.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use panedock_protocol::{now_ms, DiscoverySource, EditorInstance};
use tracing::{debug, info, warn};

use super::is_editor_process;
use super::registry::{ordered_candidates, EditorRegistry};
use crate::command::{CommandRunner, Invocation};
use crate::error::ResolveError;
use crate::process_tree::{ProcessSnapshotter, ProcessTree};
use crate::tmux::TmuxClient;

/// Liveness checks, injectable for tests.
pub trait Liveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Socket paths must exist; `host:port` endpoints are taken on faith.
    fn endpoint_exists(&self, endpoint: &str) -> bool {
        !endpoint.starts_with('/') || Path::new(endpoint).exists()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLiveness;

impl Liveness for SystemLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // kill(pid, 0) probes existence without delivering a signal.
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

/// Well-known socket locations tried when `lsof` yields nothing.
#[derive(Debug, Clone, Default)]
pub struct EndpointTemplates {
    pub runtime_dir: Option<PathBuf>,
    /// Roots holding `nvim.$USER/<random>/nvim.<pid>.0`.
    pub tmp_roots: Vec<PathBuf>,
    pub user: Option<String>,
}

impl EndpointTemplates {
    pub fn from_env() -> Self {
        let mut tmp_roots = Vec::new();
        if let Some(tmpdir) = std::env::var_os("TMPDIR").filter(|v| !v.is_empty()) {
            tmp_roots.push(PathBuf::from(tmpdir));
        }
        let slash_tmp = PathBuf::from("/tmp");
        if !tmp_roots.contains(&slash_tmp) {
            tmp_roots.push(slash_tmp);
        }
        Self {
            runtime_dir: std::env::var_os("XDG_RUNTIME_DIR")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            tmp_roots,
            user: std::env::var("USER").ok().filter(|u| !u.is_empty()),
        }
    }

    /// Existing paths that match the templates for `pid`.
    pub fn existing_for(&self, pid: u32) -> Vec<PathBuf> {
        let socket_name = format!("nvim.{pid}.0");
        let mut found = Vec::new();

        if let Some(runtime) = &self.runtime_dir {
            let candidate = runtime.join(&socket_name);
            if candidate.exists() {
                found.push(candidate);
            }
        }

        let Some(user) = &self.user else {
            return found;
        };
        for root in &self.tmp_roots {
            let Ok(dirs) = std::fs::read_dir(root.join(format!("nvim.{user}"))) else {
                continue;
            };
            for dir in dirs.flatten() {
                let candidate = dir.path().join(&socket_name);
                if candidate.exists() {
                    found.push(candidate);
                }
            }
        }
        found
    }
}

/// Pick the socket path out of `lsof -F n` output.
pub fn endpoint_from_lsof(output: &str, pid: u32) -> Option<String> {
    let own = format!("nvim.{pid}");
    let sockets: Vec<&str> = output
        .lines()
        .filter_map(|line| line.strip_prefix('n'))
        .map(|name| name.split_whitespace().next().unwrap_or(name))
        .filter(|name| name.starts_with('/'))
        .filter(|name| {
            Path::new(name)
                .file_name()
                .and_then(|f| f.to_str())
                .is_some_and(|f| f.starts_with("nvim"))
        })
        .collect();
    sockets
        .iter()
        .find(|name| name.contains(&own))
        .or_else(|| sockets.first())
        .map(|name| name.to_string())
}

/// Working directory out of `lsof -d cwd -F n` output.
pub fn cwd_from_lsof(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix('n'))
        .map(str::to_string)
}

/// What is known about the session when resolving.
#[derive(Debug, Clone, Copy, Default)]
pub struct EditorQuery<'a> {
    pub session_id: &'a str,
    pub cwd: Option<&'a str>,
    pub editor_pid: Option<u32>,
}

pub struct EditorResolverOptions {
    pub lsof_path: String,
    pub editor_name: String,
    pub command_timeout: Duration,
    pub cache_ttl: Duration,
    pub subtree_depth: usize,
    pub templates: EndpointTemplates,
}

pub struct EditorResolver {
    registry: EditorRegistry,
    runner: Arc<dyn CommandRunner>,
    processes: Arc<ProcessSnapshotter>,
    tmux: Arc<TmuxClient>,
    liveness: Arc<dyn Liveness>,
    options: EditorResolverOptions,
    cache: DashMap<String, (Instant, EditorInstance)>,
}

impl EditorResolver {
    pub fn new(
        registry: EditorRegistry,
        runner: Arc<dyn CommandRunner>,
        processes: Arc<ProcessSnapshotter>,
        tmux: Arc<TmuxClient>,
        liveness: Arc<dyn Liveness>,
        options: EditorResolverOptions,
    ) -> Self {
        Self {
            registry,
            runner,
            processes,
            tmux,
            liveness,
            options,
            cache: DashMap::new(),
        }
    }

    pub async fn resolve(&self, query: &EditorQuery<'_>) -> Result<EditorInstance, ResolveError> {
        if let Some(cached) = self.cached(query.session_id) {
            return Ok(cached);
        }

        let found = match self.from_registry(query).await {
            Some(found) => Some(found),
            None => match self.from_session_pid(query).await {
                Some(found) => Some(found),
                None => match self.from_process_scan(query).await {
                    Some(found) => Some(found),
                    None => self.from_pane_scan(query).await,
                },
            },
        };

        let Some(instance) = found else {
            debug!(
                component = "editor",
                event = "editor.resolve_failed",
                session_id = %query.session_id,
                "No editor instance found"
            );
            return Err(ResolveError::NoTarget {
                kind: "editor",
                session_id: query.session_id.to_string(),
            });
        };

        info!(
            component = "editor",
            event = "editor.resolved",
            session_id = %query.session_id,
            nvim_pid = instance.pid,
            endpoint = %instance.endpoint,
            source = ?instance.source,
            "Resolved editor instance"
        );
        self.cache
            .insert(query.session_id.to_string(), (Instant::now(), instance.clone()));
        Ok(instance)
    }

    /// Forget the cached instance, e.g. after a failed call.
    pub fn invalidate(&self, session_id: &str) {
        self.cache.remove(session_id);
    }

    fn cached(&self, session_id: &str) -> Option<EditorInstance> {
        let (stored_at, instance) = self.cache.get(session_id).map(|e| e.value().clone())?;
        if stored_at.elapsed() < self.options.cache_ttl && self.probe(instance.pid, &instance.endpoint) {
            return Some(instance);
        }
        self.cache.remove(session_id);
        None
    }

    fn probe(&self, pid: u32, endpoint: &str) -> bool {
        self.liveness.is_alive(pid) && self.liveness.endpoint_exists(endpoint)
    }

    fn accept(&self, pid: u32, endpoint: String, cwd: Option<String>, source: DiscoverySource) -> Option<EditorInstance> {
        if !self.probe(pid, &endpoint) {
            debug!(
                component = "editor",
                event = "editor.probe_failed",
                nvim_pid = pid,
                endpoint = %endpoint,
                source = ?source,
                "Candidate failed liveness probe"
            );
            return None;
        }
        Some(EditorInstance {
            pid,
            endpoint,
            cwd,
            source,
            checked_at_ms: now_ms(),
        })
    }

    fn is_editor(&self, name: &str) -> bool {
        is_editor_process(name, &self.options.editor_name)
    }

    async fn from_registry(&self, query: &EditorQuery<'_>) -> Option<EditorInstance> {
        let entries = match self.registry.entries().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    component = "editor",
                    event = "editor.registry_unreadable",
                    error = %err,
                    "Skipping editor registry"
                );
                return None;
            }
        };
        ordered_candidates(&entries, query.cwd)
            .into_iter()
            .find_map(|entry| {
                self.accept(
                    entry.pid,
                    entry.endpoint.clone(),
                    entry.cwd.clone(),
                    DiscoverySource::Registry,
                )
            })
    }

    async fn from_session_pid(&self, query: &EditorQuery<'_>) -> Option<EditorInstance> {
        let pid = query.editor_pid?;
        let tree = self.processes.snapshot().await.ok()?;
        let node = tree.get(pid)?;
        if !self.is_editor(&node.name) {
            return None;
        }
        let endpoint = self.endpoint_for(pid).await?;
        let cwd = self.cwd_of(pid).await;
        self.accept(pid, endpoint, cwd, DiscoverySource::SessionPid)
    }

    async fn from_process_scan(&self, query: &EditorQuery<'_>) -> Option<EditorInstance> {
        let wanted = query.cwd?;
        let tree = self.processes.snapshot().await.ok()?;
        for pid in tree.find_named(|name| self.is_editor(name)) {
            if !self.liveness.is_alive(pid) {
                continue;
            }
            if self.cwd_of(pid).await.as_deref() != Some(wanted) {
                continue;
            }
            if let Some(endpoint) = self.endpoint_for(pid).await {
                if let Some(instance) =
                    self.accept(pid, endpoint, Some(wanted.to_string()), DiscoverySource::ProcessScan)
                {
                    return Some(instance);
                }
            }
        }
        None
    }

    async fn from_pane_scan(&self, query: &EditorQuery<'_>) -> Option<EditorInstance> {
        let wanted = query.cwd?;
        let tree: Arc<ProcessTree> = self.processes.snapshot().await.ok()?;
        let mut panes = Vec::new();
        for session in self.tmux.list_sessions().await.unwrap_or_default() {
            panes.extend(self.tmux.list_session_panes(&session).await.unwrap_or_default());
        }

        for pane in panes
            .iter()
            .filter(|p| p.current_path.as_deref() == Some(wanted))
        {
            let Some(pane_pid) = pane.pid else {
                continue;
            };
            let Some(pid) = tree.bfs_find(pane_pid, self.options.subtree_depth, |node| {
                self.is_editor(&node.name)
            }) else {
                continue;
            };
            if let Some(endpoint) = self.endpoint_for(pid).await {
                if let Some(instance) =
                    self.accept(pid, endpoint, Some(wanted.to_string()), DiscoverySource::PaneScan)
                {
                    return Some(instance);
                }
            }
        }
        None
    }

    /// Socket path from open descriptors, else the well-known templates.
    async fn endpoint_for(&self, pid: u32) -> Option<String> {
        let pid_arg = pid.to_string();
        let invocation = Invocation::new(&self.options.lsof_path)
            .args(["-a", "-p", pid_arg.as_str(), "-U", "-F", "n"])
            .timeout(self.options.command_timeout);
        if let Ok(output) = self.runner.run(&invocation).await {
            if let Some(endpoint) = endpoint_from_lsof(&output.stdout, pid) {
                return Some(endpoint);
            }
        }
        self.options
            .templates
            .existing_for(pid)
            .into_iter()
            .next()
            .map(|p| p.to_string_lossy().into_owned())
    }

    async fn cwd_of(&self, pid: u32) -> Option<String> {
        let pid_arg = pid.to_string();
        let invocation = Invocation::new(&self.options.lsof_path)
            .args(["-a", "-p", pid_arg.as_str(), "-d", "cwd", "-F", "n"])
            .timeout(self.options.command_timeout);
        let output = self.runner.run(&invocation).await.ok()?;
        cwd_from_lsof(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::*;
    use crate::command::testing::ScriptedRunner;

    struct FakeLiveness {
        alive: HashSet<u32>,
    }

    impl FakeLiveness {
        fn with(pids: &[u32]) -> Arc<Self> {
            Arc::new(Self {
                alive: pids.iter().copied().collect(),
            })
        }
    }

    impl Liveness for FakeLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.contains(&pid)
        }

        fn endpoint_exists(&self, _endpoint: &str) -> bool {
            true
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry_path: PathBuf,
    }

    fn fixture(registry: serde_json::Value) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("nvim-registry.json");
        std::fs::write(&registry_path, registry.to_string()).unwrap();
        Fixture {
            _dir: dir,
            registry_path,
        }
    }

    fn resolver(fx: &Fixture, runner: Arc<ScriptedRunner>, liveness: Arc<dyn Liveness>) -> EditorResolver {
        let processes = Arc::new(ProcessSnapshotter::new(
            runner.clone(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        ));
        let tmux = Arc::new(TmuxClient::new(
            runner.clone(),
            "tmux",
            Duration::from_secs(1),
            Duration::from_millis(1),
            Duration::from_millis(1),
        ));
        EditorResolver::new(
            EditorRegistry::new(fx.registry_path.clone(), Duration::from_secs(60)),
            runner,
            processes,
            tmux,
            liveness,
            EditorResolverOptions {
                lsof_path: "lsof".into(),
                editor_name: "nvim".into(),
                command_timeout: Duration::from_secs(1),
                cache_ttl: Duration::from_secs(60),
                subtree_depth: 6,
                templates: EndpointTemplates::default(),
            },
        )
    }

    fn query<'a>(cwd: &'a str, editor_pid: Option<u32>) -> EditorQuery<'a> {
        EditorQuery {
            session_id: "s1",
            cwd: Some(cwd),
            editor_pid,
        }
    }

    #[test]
    fn lsof_socket_selection() {
        let out = "p4242\nf12\nn/tmp/other.sock\nf13\nn/tmp/nvim.me/Xy/nvim.4242.0\n";
        assert_eq!(
            endpoint_from_lsof(out, 4242).as_deref(),
            Some("/tmp/nvim.me/Xy/nvim.4242.0")
        );
        assert_eq!(endpoint_from_lsof("p1\nf3\nntype=STREAM\n", 1), None);
        assert_eq!(cwd_from_lsof("p1\nfcwd\nn/repo\n").as_deref(), Some("/repo"));
    }

    #[test]
    fn templates_find_existing_sockets() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("run");
        std::fs::create_dir_all(&runtime).unwrap();
        std::fs::write(runtime.join("nvim.77.0"), "").unwrap();
        let nested = dir.path().join("nvim.me").join("abc");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("nvim.77.0"), "").unwrap();

        let templates = EndpointTemplates {
            runtime_dir: Some(runtime.clone()),
            tmp_roots: vec![dir.path().to_path_buf()],
            user: Some("me".into()),
        };
        let found = templates.existing_for(77);
        assert_eq!(found, vec![runtime.join("nvim.77.0"), nested.join("nvim.77.0")]);
        assert!(templates.existing_for(78).is_empty());
    }

    #[tokio::test]
    async fn registry_skips_dead_candidates() {
        let fx = fixture(json!({"instances": [
            {"pid": 10, "endpoint": "/tmp/a", "cwd": "/repo", "tmuxSession": "main"},
            {"pid": 20, "endpoint": "/tmp/b", "cwd": "/repo", "tmuxPane": 2}
        ]}));
        let r = resolver(&fx, Arc::new(ScriptedRunner::new()), FakeLiveness::with(&[20]));
        let found = r.resolve(&query("/repo", None)).await.unwrap();
        assert_eq!(found.pid, 20);
        assert_eq!(found.source, DiscoverySource::Registry);
    }

    #[tokio::test]
    async fn session_pid_requires_editor_name() {
        let fx = fixture(json!({"instances": []}));
        let runner = Arc::new(
            ScriptedRunner::new()
                .on(&["ps"], "1 0 init\n300 1 nvim\n400 1 zsh\n")
                .on(&["lsof", "-a", "-p", "300", "-U"], "p300\nn/run/nvim.300.0\n")
                .on(&["lsof", "-a", "-p", "300", "-d", "cwd"], "p300\nn/repo\n"),
        );
        let r = resolver(&fx, runner.clone(), FakeLiveness::with(&[300, 400]));

        let found = r.resolve(&query("/nope", Some(300))).await.unwrap();
        assert_eq!(found.source, DiscoverySource::SessionPid);
        assert_eq!(found.endpoint, "/run/nvim.300.0");
        assert_eq!(found.cwd.as_deref(), Some("/repo"));

        r.invalidate("s1");
        let err = r.resolve(&query("/nope", Some(400))).await.unwrap_err();
        assert!(matches!(err, ResolveError::NoTarget { .. }));
    }

    #[tokio::test]
    async fn process_scan_matches_exact_cwd() {
        let fx = fixture(json!({"instances": []}));
        let runner = Arc::new(
            ScriptedRunner::new()
                .on(&["ps"], "1 0 init\n500 1 nvim\n600 1 nvim\n")
                .on(&["lsof", "-a", "-p", "500", "-d", "cwd"], "p500\nn/repo/sub\n")
                .on(&["lsof", "-a", "-p", "600", "-d", "cwd"], "p600\nn/repo\n")
                .on(&["lsof", "-a", "-p", "600", "-U"], "p600\nn/tmp/nvim.me/q/nvim.600.0\n"),
        );
        let r = resolver(&fx, runner, FakeLiveness::with(&[500, 600]));
        let found = r.resolve(&query("/repo", None)).await.unwrap();
        assert_eq!(found.pid, 600);
        assert_eq!(found.source, DiscoverySource::ProcessScan);
    }

    #[tokio::test]
    async fn pane_scan_walks_pane_subtree() {
        let fx = fixture(json!({"instances": []}));
        // nvim is only reachable below the pane shell; its own cwd lookup fails.
        let runner = Arc::new(
            ScriptedRunner::new()
                .on(&["ps"], "1 0 init\n100 1 tmux\n110 100 zsh\n120 110 nvim\n")
                .on(&["tmux", "list-sessions"], "main\n")
                .on(&["tmux", "list-panes", "-s", "-t", "main"], "%1\tmain:0.0\t110\t/repo\n")
                .on(&["lsof", "-a", "-p", "120", "-U"], "p120\nn/tmp/nvim.me/z/nvim.120.0\n"),
        );
        let r = resolver(&fx, runner, FakeLiveness::with(&[120]));
        let found = r.resolve(&query("/repo", None)).await.unwrap();
        assert_eq!(found.pid, 120);
        assert_eq!(found.source, DiscoverySource::PaneScan);
    }

    #[tokio::test]
    async fn cached_instance_is_reprobed() {
        let fx = fixture(json!({"instances": [{"pid": 10, "endpoint": "/tmp/a", "cwd": "/repo"}]}));
        let r = resolver(&fx, Arc::new(ScriptedRunner::new()), FakeLiveness::with(&[10]));
        assert_eq!(r.resolve(&query("/repo", None)).await.unwrap().pid, 10);
        assert!(r.cached("s1").is_some());

        let dead = resolver(&fx, Arc::new(ScriptedRunner::new()), FakeLiveness::with(&[]));
        dead.cache.insert(
            "s1".into(),
            (
                Instant::now(),
                EditorInstance {
                    pid: 10,
                    endpoint: "/tmp/a".into(),
                    cwd: None,
                    source: DiscoverySource::Registry,
                    checked_at_ms: 0,
                },
            ),
        );
        assert!(dead.cached("s1").is_none());
        assert!(dead.resolve(&query("/repo", None)).await.is_err());
    }
}
