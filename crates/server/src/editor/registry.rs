//! Self-registration file written by editor instances.
//!
//! ```json
//! {"instances": [{"pid": 123, "listenAddress": "/tmp/nvim.me/0/nvim.123.0",
//!                 "cwd": "/repo", "registeredAt": 1700000000,
//!                 "tmuxSession": "main", "tmuxWindow": 0, "tmuxPane": 1}]}
//! ```

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read editor registry {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed editor registry {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub pid: u32,
    #[serde(alias = "listenAddress")]
    pub endpoint: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub registered_at: Option<Value>,
    #[serde(default)]
    pub tmux_session: Option<String>,
    #[serde(default)]
    pub tmux_window: Option<Value>,
    #[serde(default)]
    pub tmux_pane: Option<Value>,
}

impl RegistryEntry {
    pub fn has_pane_metadata(&self) -> bool {
        self.tmux_session.is_some() || self.tmux_pane.is_some()
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    instances: Vec<RegistryEntry>,
}

pub fn parse_registry(contents: &str, path: &std::path::Path) -> Result<Vec<RegistryEntry>, RegistryError> {
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<RegistryFile>(contents)
        .map(|file| file.instances)
        .map_err(|source| RegistryError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// Candidates in preference order, deduplicated by pid:
/// pane-annotated entries (compatible cwd), then the unique cwd match, then a sole entry.
pub fn ordered_candidates<'a>(
    entries: &'a [RegistryEntry],
    cwd: Option<&str>,
) -> Vec<&'a RegistryEntry> {
    let cwd_compatible = |entry: &RegistryEntry| match (cwd, entry.cwd.as_deref()) {
        (Some(wanted), Some(have)) => wanted == have,
        _ => true,
    };

    let mut ordered: Vec<&RegistryEntry> = entries
        .iter()
        .filter(|e| e.has_pane_metadata() && cwd_compatible(e))
        .collect();

    if let Some(wanted) = cwd {
        let mut matching = entries.iter().filter(|e| e.cwd.as_deref() == Some(wanted));
        if let (Some(only), None) = (matching.next(), matching.next()) {
            ordered.push(only);
        }
    }

    if let [sole] = entries {
        ordered.push(sole);
    }

    let mut seen = std::collections::HashSet::new();
    ordered.retain(|e| seen.insert(e.pid));
    ordered
}

/// Reads the registry file with a short read cache.
pub struct EditorRegistry {
    path: PathBuf,
    ttl: Duration,
    cached: Mutex<Option<(Instant, Arc<Vec<RegistryEntry>>)>>,
}

impl EditorRegistry {
    pub fn new(path: PathBuf, ttl: Duration) -> Self {
        Self {
            path,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// A missing file is an empty registry.
    pub async fn entries(&self) -> Result<Arc<Vec<RegistryEntry>>, RegistryError> {
        let mut cached = self.cached.lock().await;
        if let Some((read_at, entries)) = cached.as_ref() {
            if read_at.elapsed() < self.ttl {
                return Ok(entries.clone());
            }
        }

        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let entries = Arc::new(parse_registry(&contents, &self.path)?);
        *cached = Some((Instant::now(), entries.clone()));
        Ok(entries)
    }

    /// Drop the cached read; the next lookup hits the file.
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }
}
