//! Runtime knobs for the core: intervals, timeouts, thresholds, executable names.

use std::path::PathBuf;
use std::time::Duration;

use crate::paths::Paths;

pub const DEFAULT_BIND: &str = "127.0.0.1:4050";
pub const DEFAULT_BRIDGE: &str = "panedock-nvim-bridge";

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Executables
    pub tmux_path: String,
    pub lsof_path: String,
    pub bridge_path: String,
    pub editor_process_name: String,

    /// Upper bound for every short shell-out (`ps`, `tmux`, `lsof`).
    pub command_timeout: Duration,
    pub rpc_timeout: Duration,
    pub process_snapshot_ttl: Duration,

    pub pane_settle_delay: Duration,
    pub reject_message_delay: Duration,

    pub registry_path: PathBuf,
    pub registry_cache_ttl: Duration,
    pub editor_cache_ttl: Duration,
    pub editor_subtree_depth: usize,

    /// Fallback poll for watched files when `notify` is silent or unavailable.
    pub watch_poll_interval: Duration,

    pub health_interval: Duration,
    pub health_concurrency: usize,

    pub sweep_interval: Duration,
    pub stale_threshold: Duration,
    pub stale_strike_limit: u32,

    pub event_queue_capacity: usize,
    pub broadcast_capacity: usize,
}

impl CoreConfig {
    pub fn new(paths: &Paths) -> Self {
        Self {
            tmux_path: "tmux".into(),
            lsof_path: "lsof".into(),
            bridge_path: DEFAULT_BRIDGE.into(),
            editor_process_name: "nvim".into(),
            command_timeout: Duration::from_secs(3),
            rpc_timeout: Duration::from_secs(5),
            process_snapshot_ttl: Duration::from_secs(1),
            pane_settle_delay: Duration::from_millis(100),
            reject_message_delay: Duration::from_millis(300),
            registry_path: paths.editor_registry_path(),
            registry_cache_ttl: Duration::from_secs(3),
            editor_cache_ttl: Duration::from_secs(5),
            editor_subtree_depth: 6,
            watch_poll_interval: Duration::from_secs(2),
            health_interval: Duration::from_secs(15),
            health_concurrency: 4,
            sweep_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            stale_strike_limit: 3,
            event_queue_capacity: 1024,
            broadcast_capacity: 256,
        }
    }

    pub fn with_bridge(mut self, bridge: Option<String>) -> Self {
        if let Some(bridge) = bridge.filter(|b| !b.trim().is_empty()) {
            self.bridge_path = bridge;
        }
        self
    }

    pub fn with_registry(mut self, registry: Option<PathBuf>) -> Self {
        if let Some(path) = registry {
            self.registry_path = path;
        }
        self
    }
}
