//! Path resolution for PaneDock data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `PANEDOCK_DATA_DIR` env > `~/.panedock`,
//! then passed around as a [`Paths`] value.

use std::io;
use std::path::{Path, PathBuf};

const DATA_DIR_ENV: &str = "PANEDOCK_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    data_dir: PathBuf,
    home_dir: PathBuf,
}

impl Paths {
    /// Priority: `explicit` arg > `PANEDOCK_DATA_DIR` env > `~/.panedock`.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        let data_dir = if let Some(p) = explicit {
            p.to_path_buf()
        } else if let Some(env_val) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            PathBuf::from(env_val)
        } else {
            home_dir.join(".panedock")
        };
        Self { data_dir, home_dir }
    }

    /// Rooted at an explicit directory, also used as home. For tests.
    pub fn rooted_at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            data_dir: dir.join(".panedock"),
            home_dir: dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("panedock.sock")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir.join("panedock.pid")
    }

    /// Editor instances self-register here.
    pub fn editor_registry_path(&self) -> PathBuf {
        self.data_dir.join("nvim-registry.json")
    }

    /// Root of the agent's per-project transcript directories.
    pub fn transcripts_root(&self) -> PathBuf {
        self.home_dir.join(".claude").join("projects")
    }

    /// `<root>/<cwd with separators replaced by '-'>`
    pub fn project_dir(&self, cwd: &str) -> PathBuf {
        self.transcripts_root().join(project_dir_name(cwd))
    }

    pub fn transcript_path(&self, cwd: &str, session_id: &str) -> PathBuf {
        self.project_dir(cwd).join(format!("{session_id}.jsonl"))
    }

    /// Create all required subdirectories under the data dir.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}

pub fn project_dir_name(cwd: &str) -> String {
    cwd.replace(['/', '.', '_'], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins() {
        let paths = Paths::resolve(Some(Path::new("/tmp/pd-explicit")));
        assert_eq!(paths.data_dir(), Path::new("/tmp/pd-explicit"));
        assert_eq!(
            paths.socket_path(),
            PathBuf::from("/tmp/pd-explicit/panedock.sock")
        );
    }

    #[test]
    fn transcript_paths_follow_project_naming() {
        let paths = Paths::rooted_at("/home/me");
        assert_eq!(project_dir_name("/Users/me/src/my.app"), "-Users-me-src-my-app");
        assert_eq!(
            paths.transcript_path("/work/repo", "abc"),
            PathBuf::from("/home/me/.claude/projects/-work-repo/abc.jsonl")
        );
    }

    #[test]
    fn ensure_dirs_creates_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::rooted_at(tmp.path());
        paths.ensure_dirs().unwrap();
        assert!(paths.log_dir().is_dir());
    }
}
