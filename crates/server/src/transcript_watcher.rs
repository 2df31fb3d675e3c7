//! Incremental transcript tailing
//!
//! Each watched file gets one task that owns its [`TailState`], so reads and
//! offset updates for a file never interleave. The task wakes on `notify`
//! events for the parent directory (non-recursive) and on a slow poll tick,
//! which also covers directories that do not exist yet.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::interrupt_watcher::InterruptConsumer;
use crate::paths::Paths;
use crate::session_command::EventSink;
use crate::transcript::{parse_line, ParsedLine, TranscriptBatch};
use crate::transition::{DeltaSource, Input, TranscriptDelta};

/// Outcome of one stat-and-read cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailRead {
    Unchanged,
    /// Complete lines appended since the last read.
    Appended(Vec<String>),
    /// First load, or the file shrank: every complete line from the start.
    Reloaded(Vec<String>),
}

/// Byte offset and dedup state for one file.
#[derive(Debug)]
pub struct TailState {
    path: PathBuf,
    offset: u64,
    pending: Vec<u8>,
    seen_ids: HashSet<String>,
    loaded: bool,
}

impl TailState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            pending: Vec::new(),
            seen_ids: HashSet::new(),
            loaded: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Records an id; false if it was emitted before.
    pub fn first_sighting(&mut self, id: &str) -> bool {
        self.seen_ids.insert(id.to_string())
    }

    /// Forget every id except `keep`; used after `/clear`, when earlier
    /// records can no longer reappear in the session.
    pub fn reset_seen<'a>(&mut self, keep: impl IntoIterator<Item = &'a str>) {
        self.seen_ids = keep.into_iter().map(str::to_string).collect();
    }

    #[cfg(test)]
    pub fn seen_count(&self) -> usize {
        self.seen_ids.len()
    }

    /// A missing file reads as unchanged until it appears.
    pub fn read(&mut self) -> Result<TailRead, WatchError> {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(TailRead::Unchanged),
            Err(source) => return Err(self.read_error(source)),
        };

        let reload = !self.loaded || size < self.offset;
        if !reload && size == self.offset {
            return Ok(TailRead::Unchanged);
        }
        let start = if reload { 0 } else { self.offset };

        let chunk = read_range(&self.path, start, size - start).map_err(|e| self.read_error(e))?;

        // Only touch state once the read has fully succeeded.
        if reload {
            self.pending.clear();
            self.seen_ids.clear();
        }
        self.loaded = true;
        self.offset = start + chunk.len() as u64;

        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(&chunk);
        let complete = match bytes.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => {
                self.pending = bytes.split_off(last_newline + 1);
                bytes
            }
            None => {
                self.pending = bytes;
                Vec::new()
            }
        };

        let lines = String::from_utf8_lossy(&complete)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        Ok(if reload {
            TailRead::Reloaded(lines)
        } else {
            TailRead::Appended(lines)
        })
    }

    fn read_error(&self, source: io::Error) -> WatchError {
        WatchError::Read {
            path: self.path.clone(),
            source,
        }
    }
}

fn read_range(path: &Path, offset: u64, len: u64) -> io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len as usize);
    file.take(len).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Turns tail reads into store inputs.
pub trait TailConsumer: Send + 'static {
    fn kind(&self) -> &'static str;
    fn consume(&mut self, tail: &mut TailState, read: TailRead) -> Option<Input>;
}

/// Parses transcript records into [`TranscriptDelta`]s.
pub struct TranscriptConsumer {
    source: DeltaSource,
}

impl TranscriptConsumer {
    pub fn session() -> Self {
        Self {
            source: DeltaSource::Session,
        }
    }

    pub fn subagent(task_tool_use_id: impl Into<String>) -> Self {
        Self {
            source: DeltaSource::Subagent {
                task_tool_use_id: task_tool_use_id.into(),
            },
        }
    }
}

impl TailConsumer for TranscriptConsumer {
    fn kind(&self) -> &'static str {
        match self.source {
            DeltaSource::Session => "session_transcript",
            DeltaSource::Subagent { .. } => "subagent_transcript",
        }
    }

    fn consume(&mut self, tail: &mut TailState, read: TailRead) -> Option<Input> {
        let (lines, incremental) = match read {
            TailRead::Unchanged => return None,
            TailRead::Appended(lines) => (lines, true),
            TailRead::Reloaded(lines) => (lines, false),
        };

        let parsed: Vec<ParsedLine> = lines
            .iter()
            .filter_map(|line| parse_line(line))
            .filter(|record| tail.first_sighting(&record.uuid))
            .collect();
        if let Some(clear_at) = parsed.iter().rposition(|record| record.is_clear) {
            tail.reset_seen(parsed[clear_at..].iter().map(|record| record.uuid.as_str()));
        }
        let batch = TranscriptBatch::from_lines(parsed);
        let incremental = incremental && !batch.cleared;
        if incremental && batch.is_empty() {
            return None;
        }

        Some(Input::FileDelta(TranscriptDelta {
            source: self.source.clone(),
            incremental,
            batch,
        }))
    }
}

/// Stop handle for a tail task. Stopping twice is fine; dropping also stops.
pub struct WatchHandle {
    path: PathBuf,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the per-file task.
pub fn spawn_tail<C: TailConsumer>(
    path: PathBuf,
    session_id: String,
    consumer: C,
    sink: EventSink,
    poll_interval: Duration,
) -> WatchHandle {
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run_tail(
        path.clone(),
        session_id,
        consumer,
        sink,
        stop_rx,
        poll_interval,
    ));
    WatchHandle { path, stop, task }
}

async fn run_tail<C: TailConsumer>(
    path: PathBuf,
    session_id: String,
    mut consumer: C,
    sink: EventSink,
    mut stop_rx: watch::Receiver<bool>,
    poll_interval: Duration,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let _watcher = match watch_parent(&path, tx) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            debug!(
                component = "transcript_watcher",
                event = "transcript_watcher.notify_unavailable",
                path = %path.display(),
                error = %err,
                "Falling back to polling"
            );
            None
        }
    };

    info!(
        component = "transcript_watcher",
        event = "transcript_watcher.started",
        session_id = %session_id,
        kind = consumer.kind(),
        path = %path.display(),
        "Watching file"
    );

    let mut tail = TailState::new(path.clone());
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            Some(()) = rx.recv() => {
                // coalesce bursts into one read
                while rx.try_recv().is_ok() {}
                poll_once(&mut tail, &mut consumer, &sink, &session_id).await;
            }
            _ = ticker.tick() => {
                poll_once(&mut tail, &mut consumer, &sink, &session_id).await;
            }
        }
    }

    debug!(
        component = "transcript_watcher",
        event = "transcript_watcher.stopped",
        session_id = %session_id,
        kind = consumer.kind(),
        path = %path.display(),
        offset = tail.offset(),
        "Stopped watching file"
    );
}

async fn poll_once<C: TailConsumer>(
    tail: &mut TailState,
    consumer: &mut C,
    sink: &EventSink,
    session_id: &str,
) {
    match tail.read() {
        Ok(read) => {
            if let Some(input) = consumer.consume(tail, read) {
                sink.submit(session_id, input).await;
            }
        }
        Err(err) => warn!(
            component = "transcript_watcher",
            event = "transcript_watcher.read_failed",
            session_id = %session_id,
            path = %tail.path().display(),
            error = %err,
            "Failed to read watched file"
        ),
    }
}

fn watch_parent(path: &Path, tx: mpsc::UnboundedSender<()>) -> Result<RecommendedWatcher, WatchError> {
    let notify_error = |source: notify::Error| WatchError::Notify {
        path: path.to_path_buf(),
        source,
    };
    let parent = path
        .parent()
        .ok_or_else(|| notify_error(notify::Error::generic("watched path has no parent")))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| notify_error(notify::Error::generic("watched path has no file name")))?;

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else {
                return;
            };
            if !matches_supported_event_kind(&event.kind) {
                return;
            }
            if event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()))
            {
                let _ = tx.send(());
            }
        },
        notify::Config::default(),
    )
    .map_err(notify_error)?;
    watcher
        .watch(parent, RecursiveMode::NonRecursive)
        .map_err(notify_error)?;
    Ok(watcher)
}

fn matches_supported_event_kind(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    )
}

// ---------------------------------------------------------------------------
// Supervisor: which files are watched for which session
// ---------------------------------------------------------------------------

struct SessionWatches {
    transcript: WatchHandle,
    interrupts: WatchHandle,
    subagents: HashMap<String, WatchHandle>,
}

impl SessionWatches {
    fn stop_all(&self) {
        self.transcript.stop();
        self.interrupts.stop();
        for handle in self.subagents.values() {
            handle.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubagentRead {
    Follow,
    Once,
}

/// A subagent request that arrived before its session transcript was watched.
#[derive(Debug)]
struct PendingSubagent {
    task_tool_use_id: String,
    agent_id: String,
    read: SubagentRead,
}

/// Owned by the store actor; never shared.
pub struct WatcherSupervisor {
    sink: EventSink,
    paths: Paths,
    poll_interval: Duration,
    sessions: HashMap<String, SessionWatches>,
    pending: HashMap<String, Vec<PendingSubagent>>,
}

impl WatcherSupervisor {
    pub fn new(sink: EventSink, paths: Paths, poll_interval: Duration) -> Self {
        Self {
            sink,
            paths,
            poll_interval,
            sessions: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Start session + interrupt watchers unless a live watcher already
    /// follows the same file.
    pub fn ensure_session(&mut self, session_id: &str, cwd: &str, transcript_path: Option<&str>) -> bool {
        let path = transcript_path
            .map(PathBuf::from)
            .unwrap_or_else(|| self.paths.transcript_path(cwd, session_id));

        if let Some(existing) = self.sessions.get(session_id) {
            if existing.transcript.path() == path && !existing.transcript.is_finished() {
                return false;
            }
            existing.stop_all();
        }

        let transcript = spawn_tail(
            path.clone(),
            session_id.to_string(),
            TranscriptConsumer::session(),
            self.sink.clone(),
            self.poll_interval,
        );
        let interrupts = spawn_tail(
            path,
            session_id.to_string(),
            InterruptConsumer::default(),
            self.sink.clone(),
            self.poll_interval,
        );
        self.sessions.insert(
            session_id.to_string(),
            SessionWatches {
                transcript,
                interrupts,
                subagents: HashMap::new(),
            },
        );

        for queued in self.pending.remove(session_id).unwrap_or_default() {
            match queued.read {
                SubagentRead::Follow => {
                    self.start_subagent(session_id, &queued.task_tool_use_id, &queued.agent_id);
                }
                SubagentRead::Once => {
                    self.load_subagent(session_id, &queued.task_tool_use_id, &queued.agent_id);
                }
            }
        }
        true
    }

    fn queue_subagent(&mut self, session_id: &str, task_tool_use_id: &str, agent_id: &str, read: SubagentRead) {
        debug!(
            component = "transcript_watcher",
            event = "transcript_watcher.subagent_queued",
            session_id = %session_id,
            task_tool_use_id = %task_tool_use_id,
            "No session transcript watched yet; subagent queued"
        );
        let queue = self.pending.entry(session_id.to_string()).or_default();
        queue.retain(|p| p.task_tool_use_id != task_tool_use_id);
        queue.push(PendingSubagent {
            task_tool_use_id: task_tool_use_id.to_string(),
            agent_id: agent_id.to_string(),
            read,
        });
    }

    fn agent_path(&self, session_id: &str, agent_id: &str) -> Option<PathBuf> {
        let dir = self.sessions.get(session_id)?.transcript.path().parent()?;
        Some(dir.join(format!("agent-{agent_id}.jsonl")))
    }

    /// Follow a subagent transcript. Returns false when nothing was spawned
    /// now; a request for an unwatched session runs once it is watched.
    pub fn start_subagent(&mut self, session_id: &str, task_tool_use_id: &str, agent_id: &str) -> bool {
        if !self.sessions.contains_key(session_id) {
            self.queue_subagent(session_id, task_tool_use_id, agent_id, SubagentRead::Follow);
            return false;
        }
        let Some(path) = self.agent_path(session_id, agent_id) else {
            return false;
        };
        let Some(watches) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if watches.subagents.contains_key(task_tool_use_id) {
            return false;
        }
        let handle = spawn_tail(
            path,
            session_id.to_string(),
            TranscriptConsumer::subagent(task_tool_use_id),
            self.sink.clone(),
            self.poll_interval,
        );
        watches.subagents.insert(task_tool_use_id.to_string(), handle);
        true
    }

    /// Read a finished subagent's transcript once from the start.
    pub fn load_subagent(&mut self, session_id: &str, task_tool_use_id: &str, agent_id: &str) -> bool {
        if !self.sessions.contains_key(session_id) {
            self.queue_subagent(session_id, task_tool_use_id, agent_id, SubagentRead::Once);
            return false;
        }
        let Some(path) = self.agent_path(session_id, agent_id) else {
            return false;
        };
        let sink = self.sink.clone();
        let session_id = session_id.to_string();
        let mut consumer = TranscriptConsumer::subagent(task_tool_use_id);
        tokio::spawn(async move {
            let mut tail = TailState::new(path);
            poll_once(&mut tail, &mut consumer, &sink, &session_id).await;
        });
        true
    }

    pub fn stop_subagent(&mut self, session_id: &str, task_tool_use_id: &str) {
        // a queued follow becomes a single read of the finished file
        if let Some(queued) = self
            .pending
            .get_mut(session_id)
            .and_then(|q| q.iter_mut().find(|p| p.task_tool_use_id == task_tool_use_id))
        {
            queued.read = SubagentRead::Once;
        }
        if let Some(handle) = self
            .sessions
            .get_mut(session_id)
            .and_then(|w| w.subagents.remove(task_tool_use_id))
        {
            handle.stop();
        }
    }

    pub fn stop_session(&mut self, session_id: &str) {
        self.pending.remove(session_id);
        if let Some(watches) = self.sessions.remove(session_id) {
            watches.stop_all();
        }
    }

    pub fn shutdown(&mut self) {
        self.pending.clear();
        for (_, watches) in self.sessions.drain() {
            watches.stop_all();
        }
    }

    #[cfg(test)]
    pub fn watched_path(&self, session_id: &str) -> Option<&Path> {
        self.sessions.get(session_id).map(|w| w.transcript.path())
    }

    #[cfg(test)]
    pub fn subagent_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|w| w.subagents.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn pending_count(&self, session_id: &str) -> usize {
        self.pending.get(session_id).map(Vec::len).unwrap_or(0)
    }
}
