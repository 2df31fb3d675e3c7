//! Point-in-time process tree.
//!
//! One `ps` call produces an immutable [`ProcessTree`]; nothing is updated
//! in place. [`ProcessSnapshotter`] keeps the last tree for a short TTL so a
//! burst of resolutions shares a single enumeration.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::command::{CommandError, CommandRunner, Invocation};

/// Parent-chain walks stop after this many hops.
pub const MAX_ANCESTOR_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessNode {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessTree {
    nodes: HashMap<u32, ProcessNode>,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessTree {
    pub fn from_nodes(nodes: impl IntoIterator<Item = ProcessNode>) -> Self {
        let mut tree = ProcessTree::default();
        for node in nodes {
            tree.nodes.insert(node.pid, node);
        }
        for node in tree.nodes.values() {
            if node.ppid != node.pid {
                tree.children.entry(node.ppid).or_default().push(node.pid);
            }
        }
        for kids in tree.children.values_mut() {
            kids.sort_unstable();
        }
        tree
    }

    /// Parse `ps -axo pid=,ppid=,comm=` output. Unparseable lines are skipped.
    pub fn parse_ps(output: &str) -> Self {
        Self::from_nodes(output.lines().filter_map(parse_ps_line))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessNode> {
        self.nodes.get(&pid)
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.nodes.contains_key(&pid)
    }

    pub fn children(&self, pid: u32) -> &[u32] {
        self.children.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Walk parent links from `pid` (exclusive), nearest first.
    pub fn ancestors(&self, pid: u32) -> Vec<u32> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = pid;
        seen.insert(current);
        for _ in 0..MAX_ANCESTOR_DEPTH {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            let parent = node.ppid;
            if parent == 0 || !seen.insert(parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// True iff `ancestor` appears in the bounded parent chain of `pid`.
    pub fn is_descendant(&self, pid: u32, ancestor: u32) -> bool {
        self.ancestors(pid).contains(&ancestor)
    }

    /// Nearest ancestor whose executable name satisfies `pred`.
    pub fn find_ancestor_named(&self, pid: u32, pred: impl Fn(&str) -> bool) -> Option<u32> {
        self.ancestors(pid)
            .into_iter()
            .find(|p| self.nodes.get(p).is_some_and(|n| pred(&n.name)))
    }

    /// Breadth-first search below `root` (exclusive) up to `max_depth` levels.
    pub fn bfs_find(
        &self,
        root: u32,
        max_depth: usize,
        pred: impl Fn(&ProcessNode) -> bool,
    ) -> Option<u32> {
        let mut queue = VecDeque::from([(root, 0usize)]);
        let mut seen = HashSet::from([root]);
        while let Some((pid, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for &child in self.children(pid) {
                if !seen.insert(child) {
                    continue;
                }
                if let Some(node) = self.nodes.get(&child) {
                    if pred(node) {
                        return Some(child);
                    }
                }
                queue.push_back((child, depth + 1));
            }
        }
        None
    }

    /// All processes whose executable name satisfies `pred`.
    pub fn find_named(&self, pred: impl Fn(&str) -> bool) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .nodes
            .values()
            .filter(|n| pred(&n.name))
            .map(|n| n.pid)
            .collect();
        pids.sort_unstable();
        pids
    }
}

fn parse_ps_line(line: &str) -> Option<ProcessNode> {
    let mut parts = line.split_whitespace();
    let pid = parts.next()?.parse::<u32>().ok()?;
    let ppid = parts.next()?.parse::<u32>().ok()?;
    let command = parts.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return None;
    }
    Some(ProcessNode {
        pid,
        ppid,
        name: exec_basename(&command),
    })
}

/// `comm` is a full path on macOS and a bare name on Linux; normalize.
pub fn exec_basename(command: &str) -> String {
    let trimmed = command.trim().trim_start_matches('-');
    Path::new(trimmed)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(trimmed)
        .to_string()
}

/// Builds process trees through a [`CommandRunner`] with a short-lived cache.
pub struct ProcessSnapshotter {
    runner: Arc<dyn CommandRunner>,
    ttl: Duration,
    timeout: Duration,
    cached: Mutex<Option<(Instant, Arc<ProcessTree>)>>,
}

impl ProcessSnapshotter {
    pub fn new(runner: Arc<dyn CommandRunner>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            runner,
            ttl,
            timeout,
            cached: Mutex::new(None),
        }
    }

    /// Cached snapshot if still fresh, otherwise a new one.
    pub async fn snapshot(&self) -> Result<Arc<ProcessTree>, CommandError> {
        let mut cached = self.cached.lock().await;
        if let Some((taken_at, tree)) = cached.as_ref() {
            if taken_at.elapsed() < self.ttl {
                return Ok(tree.clone());
            }
        }
        let tree = Arc::new(self.enumerate().await?);
        *cached = Some((Instant::now(), tree.clone()));
        Ok(tree)
    }

    /// Always enumerate; used by the sweeper, which must not see stale data.
    pub async fn fresh(&self) -> Result<Arc<ProcessTree>, CommandError> {
        let tree = Arc::new(self.enumerate().await?);
        *self.cached.lock().await = Some((Instant::now(), tree.clone()));
        Ok(tree)
    }

    async fn enumerate(&self) -> Result<ProcessTree, CommandError> {
        let invocation = Invocation::new("ps")
            .args(["-axo", "pid=,ppid=,comm="])
            .timeout(self.timeout);
        let output = self.runner.run(&invocation).await?;
        if !output.success {
            warn!(
                component = "process_tree",
                event = "process_tree.ps_failed",
                stderr = %output.stderr.trim(),
                "ps exited unsuccessfully"
            );
        }
        let tree = ProcessTree::parse_ps(&output.stdout);
        debug!(
            component = "process_tree",
            event = "process_tree.snapshot",
            processes = tree.len(),
            "Process snapshot taken"
        );
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::testing::ScriptedRunner;

    fn node(pid: u32, ppid: u32, name: &str) -> ProcessNode {
        ProcessNode {
            pid,
            ppid,
            name: name.to_string(),
        }
    }

    fn sample_tree() -> ProcessTree {
        ProcessTree::from_nodes([
            node(1, 0, "launchd"),
            node(100, 1, "tmux"),
            node(200, 100, "zsh"),
            node(300, 200, "claude"),
        ])
    }

    #[test]
    fn descendant_walks_parent_chain() {
        let tree = sample_tree();
        assert!(tree.is_descendant(300, 100));
        assert!(tree.is_descendant(300, 1));
        assert!(!tree.is_descendant(300, 999));
        assert!(!tree.is_descendant(100, 300));
        assert!(!tree.is_descendant(300, 300));
    }

    #[test]
    fn cyclic_parent_links_terminate() {
        let tree = ProcessTree::from_nodes([node(10, 20, "a"), node(20, 10, "b")]);
        assert!(tree.is_descendant(10, 20));
        assert!(!tree.is_descendant(10, 30));
        assert_eq!(tree.ancestors(10), vec![20]);
    }

    #[test]
    fn depth_is_bounded() {
        let chain = (1..=200u32).map(|pid| node(pid, pid - 1, "sh"));
        let tree = ProcessTree::from_nodes(chain);
        assert_eq!(tree.ancestors(200).len(), MAX_ANCESTOR_DEPTH);
        assert!(!tree.is_descendant(200, 1));
        assert!(tree.is_descendant(200, 150));
    }

    #[test]
    fn parses_ps_output_with_paths() {
        let tree = ProcessTree::parse_ps(
            "    1     0 /sbin/launchd\n  512     1 /usr/local/bin/nvim\n  garbage line\n  600   512 -zsh\n",
        );
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get(512).unwrap().name, "nvim");
        assert_eq!(tree.get(600).unwrap().name, "zsh");
        assert_eq!(tree.children(512), &[600]);
    }

    #[test]
    fn finds_named_ancestor_and_subtree_match() {
        let tree = ProcessTree::from_nodes([
            node(1, 0, "init"),
            node(50, 1, "tmux"),
            node(60, 50, "zsh"),
            node(70, 60, "nvim"),
            node(80, 70, "zsh"),
            node(90, 80, "claude"),
        ]);
        assert_eq!(tree.find_ancestor_named(90, |n| n == "nvim"), Some(70));
        assert_eq!(tree.find_ancestor_named(90, |n| n == "emacs"), None);
        assert_eq!(tree.bfs_find(60, 6, |n| n.name == "nvim"), Some(70));
        assert_eq!(tree.bfs_find(50, 1, |n| n.name == "nvim"), None);
        assert_eq!(tree.find_named(|n| n == "zsh"), vec![60, 80]);
    }

    #[tokio::test]
    async fn snapshotter_caches_within_ttl() {
        let runner = Arc::new(ScriptedRunner::new().on(&["ps"], "1 0 init\n42 1 claude\n"));
        let snapshotter = ProcessSnapshotter::new(
            runner.clone(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let first = snapshotter.snapshot().await.unwrap();
        let second = snapshotter.snapshot().await.unwrap();
        assert!(first.is_alive(42));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runner.calls().len(), 1);

        snapshotter.fresh().await.unwrap();
        assert_eq!(runner.calls().len(), 2);
    }
}
