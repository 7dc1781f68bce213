//! Adaptive-interval polling of remote files.
//!
//! Each watched path gets a `WatchState` and a poll task. A poll stats the
//! path; growth is read as a byte delta and emitted as complete new lines,
//! anything else (shrink, rewrite in place) is emitted as a full reload.
//!
//! State changes go through `WatchState::apply`, a reducer over
//! `PollOutcome`, so an interleaved stop/restart can never observe a
//! half-updated state. Polls for one path are serialized by a per-path lock
//! and every result is checked against the watch generation before it is
//! applied: a poll that finishes after its watch was stopped or replaced is
//! discarded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::error::{EngineError, EngineResult};
use crate::event::{EngineEvent, EventBus, EventSource, Subscription, SubscriptionId};
use crate::model::line_split::LineAssembler;
use crate::services::remote::{with_deadline, RemoteFileService, RemotePath, RemoteStat};
use crate::services::time_source::SharedTimeSource;

/// A change younger than this speeds polling up
const RECENT_CHANGE_WINDOW: Duration = Duration::from_secs(5);
/// Without a change for this long, polling slows down
const QUIET_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub initial_interval: Duration,
    pub backoff_factor: f64,
    pub max_retries: u32,
    /// Bound on every stat/read the watcher issues
    pub remote_timeout: Duration,
    pub encoding: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(250),
            max_interval: Duration::from_millis(10_000),
            initial_interval: Duration::from_millis(1_000),
            backoff_factor: 2.0,
            max_retries: 5,
            remote_timeout: Duration::from_millis(15_000),
            encoding: "utf-8".to_string(),
        }
    }
}

impl WatchConfig {
    pub fn clamp(&self, interval: Duration) -> Duration {
        let max = self.max_interval.max(self.min_interval);
        interval.clamp(self.min_interval, max)
    }

    fn scaled(&self, interval: Duration, factor: f64) -> Duration {
        let factor = if factor.is_finite() && factor > 0.0 {
            factor
        } else {
            1.0
        };
        let secs = (interval.as_secs_f64() * factor).min(self.max_interval.as_secs_f64());
        self.clamp(Duration::from_secs_f64(secs.max(0.0)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStatus {
    Idle,
    Watching,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub polls: u64,
    pub changes: u64,
    pub incremental_updates: u64,
    pub full_reloads: u64,
    pub errors: u64,
    pub bytes_read: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchUpdateKind {
    /// Complete lines appended since the last observed position
    Incremental {
        lines: Vec<String>,
        start_offset: u64,
        end_offset: u64,
    },
    /// Previously loaded content can no longer be trusted
    FullReload { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchUpdate {
    pub path: RemotePath,
    pub kind: WatchUpdateKind,
}

/// Result of one poll's remote I/O, fed to `WatchState::apply`
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Unchanged {
        stat: RemoteStat,
    },
    /// The file grew and the delta was read
    Appended {
        stat: RemoteStat,
        text: String,
        bytes_read: u64,
    },
    /// The file shrank, was rewritten, or the delta read failed
    Rewritten {
        stat: RemoteStat,
        reason: String,
    },
    StatFailed {
        error: EngineError,
    },
}

/// What the poll loop must do after a state transition
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEffect {
    Nothing,
    Emit(WatchUpdateKind),
    Retry { retry_count: u32 },
    Stop { reason: String },
}

#[derive(Debug, Clone)]
pub struct WatchState {
    pub status: WatchStatus,
    pub current_interval: Duration,
    pub last_size: u64,
    pub last_read_position: u64,
    pub last_modified: Option<SystemTime>,
    pub retry_count: u32,
    pub is_paused: bool,
    pub started_at: Instant,
    pub last_change_at: Option<Instant>,
    pub stats: WatchStats,
    assembler: LineAssembler,
}

enum Delta {
    None,
    Grew { from: u64, length: u64 },
    Rewritten(String),
}

impl WatchState {
    pub fn new(config: &WatchConfig, started_at: Instant) -> Self {
        Self {
            status: WatchStatus::Idle,
            current_interval: config.clamp(config.initial_interval),
            last_size: 0,
            last_read_position: 0,
            last_modified: None,
            retry_count: 0,
            is_paused: false,
            started_at,
            last_change_at: None,
            stats: WatchStats::default(),
            assembler: LineAssembler::new(),
        }
    }

    /// Record the seeding stat and start watching from the current end.
    pub fn seed(&mut self, stat: &RemoteStat) {
        self.last_size = stat.size;
        self.last_read_position = stat.size;
        self.last_modified = stat.modified;
        self.status = WatchStatus::Watching;
    }

    fn delta(&self, stat: &RemoteStat) -> Delta {
        if stat.size > self.last_size {
            let from = self.last_read_position.min(stat.size);
            Delta::Grew {
                from,
                length: stat.size - from,
            }
        } else if stat.size < self.last_size {
            Delta::Rewritten(format!(
                "truncated from {} to {} bytes",
                self.last_size, stat.size
            ))
        } else if stat.modified != self.last_modified {
            Delta::Rewritten("modified without growing".to_string())
        } else {
            Delta::None
        }
    }

    /// Apply one poll result. The only place watch state changes after seeding.
    pub fn apply(
        &mut self,
        outcome: PollOutcome,
        now: Instant,
        wall: DateTime<Utc>,
        config: &WatchConfig,
    ) -> WatchEffect {
        self.stats.polls += 1;
        self.stats.last_poll_at = Some(wall);

        let effect = match outcome {
            PollOutcome::StatFailed { error } => {
                self.retry_count += 1;
                self.stats.errors += 1;
                self.stats.last_error = Some(error.to_string());
                if self.retry_count > config.max_retries {
                    self.status = WatchStatus::Stopped;
                    return WatchEffect::Stop {
                        reason: format!(
                            "giving up after {} failed polls: {}",
                            self.retry_count, error
                        ),
                    };
                }
                self.current_interval = config.scaled(self.current_interval, config.backoff_factor);
                return WatchEffect::Retry {
                    retry_count: self.retry_count,
                };
            }
            PollOutcome::Unchanged { .. } => WatchEffect::Nothing,
            // Only a cut character arrived; read it again once it completes
            PollOutcome::Appended { bytes_read: 0, .. } => WatchEffect::Nothing,
            PollOutcome::Appended {
                stat,
                text,
                bytes_read,
            } => {
                let start_offset = self.last_read_position;
                self.last_read_position += bytes_read;
                // A short read leaves the rest for the next poll
                self.last_size = self.last_read_position;
                self.last_modified = stat.modified;
                self.stats.bytes_read += bytes_read;
                self.last_change_at = Some(now);
                self.stats.changes += 1;

                let lines = self.assembler.push(&text);
                if lines.is_empty() {
                    WatchEffect::Nothing
                } else {
                    self.stats.incremental_updates += 1;
                    WatchEffect::Emit(WatchUpdateKind::Incremental {
                        lines,
                        start_offset,
                        end_offset: self.last_read_position,
                    })
                }
            }
            PollOutcome::Rewritten { stat, reason } => {
                self.last_size = stat.size;
                self.last_read_position = stat.size;
                self.last_modified = stat.modified;
                self.assembler.clear();
                self.last_change_at = Some(now);
                self.stats.changes += 1;
                self.stats.full_reloads += 1;
                WatchEffect::Emit(WatchUpdateKind::FullReload { reason })
            }
        };

        // Stat succeeded: adapt the polling rate to recent activity
        self.retry_count = 0;
        let since_change = now.saturating_duration_since(self.last_change_at.unwrap_or(self.started_at));
        if self.last_change_at.is_some() && since_change < RECENT_CHANGE_WINDOW {
            self.current_interval = config.scaled(self.current_interval, 0.5);
        } else if since_change >= QUIET_PERIOD {
            self.current_interval = config.scaled(self.current_interval, 2.0);
        } else {
            self.current_interval = config.clamp(self.current_interval);
        }
        effect
    }
}

/// What a single poll did
#[derive(Debug, Clone, PartialEq)]
pub enum PollReport {
    Unchanged,
    Updated(WatchUpdate),
    Paused,
    Retrying { retry_count: u32, error: EngineError },
    Stopped { reason: String },
    /// The path is not watched, or its watch was replaced mid-poll
    NotWatched,
}

struct WatchEntry {
    generation: u64,
    state: Arc<Mutex<WatchState>>,
    poll_lock: Arc<tokio::sync::Mutex<()>>,
    task: Option<JoinHandle<()>>,
}

struct WatcherInner {
    remote: Arc<dyn RemoteFileService>,
    config: WatchConfig,
    time: SharedTimeSource,
    bus: Arc<EventBus>,
    entries: Mutex<HashMap<RemotePath, WatchEntry>>,
    next_generation: AtomicU64,
}

/// Watches any number of paths; cheap to clone
#[derive(Clone)]
pub struct FileWatcher {
    inner: Arc<WatcherInner>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("config", &self.inner.config)
            .field("active", &self.active_count())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FileWatcher {
    pub fn new(
        remote: Arc<dyn RemoteFileService>,
        config: WatchConfig,
        time: SharedTimeSource,
    ) -> Self {
        Self {
            inner: Arc::new(WatcherInner {
                remote,
                config,
                time,
                bus: EventBus::shared(EventSource::Watcher),
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.bus.unsubscribe(id)
    }

    /// Start watching `path`, replacing any existing watch on it.
    ///
    /// The path is stat'ed immediately to seed the state; the first poll runs
    /// one interval later. Fails without registering anything if that stat
    /// fails.
    pub async fn start_watch(&self, path: &RemotePath) -> EngineResult<()> {
        self.stop_watch(path);

        let stat = self.stat(path).await?;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut state = WatchState::new(&self.inner.config, self.inner.time.now());
        state.seed(&stat);

        let entry = WatchEntry {
            generation,
            state: Arc::new(Mutex::new(state)),
            poll_lock: Arc::new(tokio::sync::Mutex::new(())),
            task: None,
        };
        let task = tokio::spawn(poll_loop(self.clone(), path.clone(), generation));

        let replaced = {
            let mut entries = lock(&self.inner.entries);
            let mut entry = entry;
            entry.task = Some(task);
            entries.insert(path.clone(), entry)
        };
        // Lost a race with a concurrent start on the same path
        if let Some(old) = replaced {
            if let Some(task) = old.task {
                task.abort();
            }
        }

        tracing::debug!("Watching {} from byte {}", path, stat.size);
        Ok(())
    }

    /// Stop watching `path`. Returns false if it was not watched.
    pub fn stop_watch(&self, path: &RemotePath) -> bool {
        let removed = lock(&self.inner.entries).remove(path);
        match removed {
            Some(entry) => {
                if let Some(task) = entry.task {
                    task.abort();
                }
                lock(&entry.state).status = WatchStatus::Stopped;
                tracing::debug!("Stopped watching {}", path);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<WatchEntry> = lock(&self.inner.entries).drain().map(|(_, e)| e).collect();
        for entry in drained {
            if let Some(task) = entry.task {
                task.abort();
            }
        }
    }

    pub fn pause_watch(&self, path: &RemotePath) -> bool {
        self.set_paused(path, true)
    }

    pub fn resume_watch(&self, path: &RemotePath) -> bool {
        self.set_paused(path, false)
    }

    fn set_paused(&self, path: &RemotePath, paused: bool) -> bool {
        let entries = lock(&self.inner.entries);
        let Some(entry) = entries.get(path) else {
            return false;
        };
        let mut state = lock(&entry.state);
        if state.status == WatchStatus::Stopped {
            return false;
        }
        state.is_paused = paused;
        state.status = if paused {
            WatchStatus::Paused
        } else {
            WatchStatus::Watching
        };
        true
    }

    pub fn is_watching(&self, path: &RemotePath) -> bool {
        lock(&self.inner.entries).contains_key(path)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    /// Snapshot of the state of a watched path
    pub fn watch_state(&self, path: &RemotePath) -> Option<WatchState> {
        let entries = lock(&self.inner.entries);
        entries.get(path).map(|entry| lock(&entry.state).clone())
    }

    /// Run one poll step now.
    ///
    /// Serialized with the background poll for the same path, so two polls
    /// for one path never overlap.
    pub async fn poll_now(&self, path: &RemotePath) -> PollReport {
        let handles = {
            let entries = lock(&self.inner.entries);
            entries
                .get(path)
                .map(|e| (e.generation, e.state.clone(), e.poll_lock.clone()))
        };
        match handles {
            Some((generation, state, poll_lock)) => {
                let _in_flight = poll_lock.lock().await;
                self.poll_step(path, generation, &state).await
            }
            None => PollReport::NotWatched,
        }
    }

    fn is_current(&self, path: &RemotePath, generation: u64) -> bool {
        lock(&self.inner.entries)
            .get(path)
            .is_some_and(|e| e.generation == generation)
    }

    async fn stat(&self, path: &RemotePath) -> EngineResult<RemoteStat> {
        with_deadline(
            "stat",
            path,
            self.inner.config.remote_timeout,
            self.inner.remote.stat(path),
        )
        .await
    }

    async fn poll_step(
        &self,
        path: &RemotePath,
        generation: u64,
        state: &Arc<Mutex<WatchState>>,
    ) -> PollReport {
        if !self.is_current(path, generation) {
            return PollReport::NotWatched;
        }
        let paused = lock(state).is_paused;
        if paused {
            return PollReport::Paused;
        }

        let outcome = match self.stat(path).await {
            Err(error) => PollOutcome::StatFailed { error },
            Ok(stat) => {
                let delta = lock(state).delta(&stat);
                match delta {
                    Delta::None => PollOutcome::Unchanged { stat },
                    Delta::Rewritten(reason) => PollOutcome::Rewritten { stat, reason },
                    Delta::Grew { from, length } => self.read_delta(path, stat, from, length).await,
                }
            }
        };

        // Stopped or restarted while the I/O was in flight
        if !self.is_current(path, generation) {
            return PollReport::NotWatched;
        }

        let failure = match &outcome {
            PollOutcome::StatFailed { error } => Some(error.clone()),
            _ => None,
        };
        let effect = lock(state).apply(
            outcome,
            self.inner.time.now(),
            self.inner.time.wall_clock(),
            &self.inner.config,
        );

        match effect {
            WatchEffect::Nothing => PollReport::Unchanged,
            WatchEffect::Emit(kind) => {
                let update = WatchUpdate {
                    path: path.clone(),
                    kind,
                };
                self.inner.bus.emit(EngineEvent::WatchUpdate(update.clone()));
                PollReport::Updated(update)
            }
            WatchEffect::Retry { retry_count } => {
                let error = failure.unwrap_or(EngineError::unknown("stat", path, "stat failed"));
                tracing::warn!("Poll of {} failed (retry {}): {}", path, retry_count, error);
                PollReport::Retrying { retry_count, error }
            }
            WatchEffect::Stop { reason } => {
                tracing::warn!("Watch on {} stopped: {}", path, reason);
                let removed = {
                    let mut entries = lock(&self.inner.entries);
                    if entries.get(path).is_some_and(|e| e.generation == generation) {
                        entries.remove(path)
                    } else {
                        None
                    }
                };
                self.inner.bus.emit(EngineEvent::WatchStopped {
                    path: path.clone(),
                    reason: reason.clone(),
                });
                // Dropping the handle detaches rather than aborts; this may be
                // running inside that very task.
                drop(removed);
                PollReport::Stopped { reason }
            }
        }
    }

    async fn read_delta(
        &self,
        path: &RemotePath,
        stat: RemoteStat,
        from: u64,
        length: u64,
    ) -> PollOutcome {
        let read = with_deadline(
            "read",
            path,
            self.inner.config.remote_timeout,
            self.inner
                .remote
                .read(path, from, Some(length), &self.inner.config.encoding),
        )
        .await;

        match read {
            Ok(result) => PollOutcome::Appended {
                stat,
                text: result.content,
                bytes_read: result.bytes_read,
            },
            Err(e) => {
                tracing::warn!("Delta read of {} failed, requesting reload: {}", path, e);
                PollOutcome::Rewritten {
                    stat,
                    reason: format!("delta read failed: {}", e),
                }
            }
        }
    }
}

async fn poll_loop(watcher: FileWatcher, path: RemotePath, generation: u64) {
    loop {
        let interval = {
            let entries = lock(&watcher.inner.entries);
            match entries.get(&path) {
                Some(entry) if entry.generation == generation => lock(&entry.state).current_interval,
                _ => return,
            }
        };
        tokio::time::sleep(interval).await;

        match watcher.poll_now(&path).await {
            PollReport::Stopped { .. } | PollReport::NotWatched => return,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::remote::MemoryRemoteBackend;
    use crate::services::time_source::TestTimeSource;
    use proptest::prelude::*;

    fn config() -> WatchConfig {
        WatchConfig {
            max_retries: 2,
            ..WatchConfig::default()
        }
    }

    fn setup(content: &str) -> (MemoryRemoteBackend, Arc<TestTimeSource>, FileWatcher, RemotePath) {
        let backend = MemoryRemoteBackend::new();
        backend.insert("/app.log", content);
        let time = TestTimeSource::shared();
        let watcher = FileWatcher::new(Arc::new(backend.clone()), config(), time.clone());
        (backend, time, watcher, RemotePath::local("/app.log"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_emits_incremental_lines() {
        let (backend, _time, watcher, path) = setup("one\ntwo\n");
        watcher.start_watch(&path).await.unwrap();
        let mut events = watcher.subscribe();

        backend.append("/app.log", "three\nfour\n");
        let report = watcher.poll_now(&path).await;

        let expected = WatchUpdate {
            path: path.clone(),
            kind: WatchUpdateKind::Incremental {
                lines: vec!["three".into(), "four".into()],
                start_offset: 8,
                end_offset: 19,
            },
        };
        assert_eq!(report, PollReport::Updated(expected.clone()));
        assert_eq!(events.drain(), vec![EngineEvent::WatchUpdate(expected)]);
        assert_eq!(watcher.watch_state(&path).unwrap().last_read_position, 19);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_line_waits_for_newline() {
        let (backend, _time, watcher, path) = setup("");
        watcher.start_watch(&path).await.unwrap();

        backend.append("/app.log", "hal");
        assert_eq!(watcher.poll_now(&path).await, PollReport::Unchanged);

        backend.append("/app.log", "f\n");
        match watcher.poll_now(&path).await {
            PollReport::Updated(WatchUpdate {
                kind: WatchUpdateKind::Incremental { lines, start_offset, end_offset },
                ..
            }) => {
                assert_eq!(lines, vec!["half"]);
                assert_eq!((start_offset, end_offset), (3, 5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_character_split_across_polls() {
        let (backend, _time, watcher, path) = setup("");
        watcher.start_watch(&path).await.unwrap();

        backend.append("/app.log", b"caf\xC3");
        assert_eq!(watcher.poll_now(&path).await, PollReport::Unchanged);
        assert_eq!(watcher.watch_state(&path).unwrap().last_read_position, 3);

        backend.append("/app.log", b"\xA9\n");
        match watcher.poll_now(&path).await {
            PollReport::Updated(WatchUpdate {
                kind: WatchUpdateKind::Incremental { lines, start_offset, end_offset },
                ..
            }) => {
                assert_eq!(lines, vec!["café"]);
                assert_eq!((start_offset, end_offset), (3, 6));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_cut_character_waits_without_counting_a_change() {
        let (backend, _time, watcher, path) = setup("a\n");
        watcher.start_watch(&path).await.unwrap();

        backend.append("/app.log", b"\xE2\x82");
        assert_eq!(watcher.poll_now(&path).await, PollReport::Unchanged);
        let state = watcher.watch_state(&path).unwrap();
        assert_eq!((state.last_size, state.last_read_position), (2, 2));
        assert_eq!(state.stats.changes, 0);

        backend.append("/app.log", b"\xAC\n");
        match watcher.poll_now(&path).await {
            PollReport::Updated(WatchUpdate {
                kind: WatchUpdateKind::Incremental { lines, .. },
                ..
            }) => assert_eq!(lines, vec!["€"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_reads_deliver_everything() {
        let (backend, _time, watcher, path) = setup("");
        watcher.start_watch(&path).await.unwrap();
        backend.set_read_limit(Some(8));

        let appended: String = (0..6).map(|i| format!("line {i}\n")).collect();
        backend.append("/app.log", appended.as_bytes());

        let mut lines = Vec::new();
        for _ in 0..20 {
            if let PollReport::Updated(WatchUpdate {
                kind: WatchUpdateKind::Incremental { lines: batch, .. },
                ..
            }) = watcher.poll_now(&path).await
            {
                lines.extend(batch);
            }
        }

        let expected: Vec<String> = (0..6).map(|i| format!("line {i}")).collect();
        assert_eq!(lines, expected);
        let state = watcher.watch_state(&path).unwrap();
        assert_eq!(state.last_read_position, appended.len() as u64);
        assert_eq!(state.last_size, appended.len() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncation_requests_full_reload() {
        let (backend, _time, watcher, path) = setup("aaaa\nbbbb\n");
        watcher.start_watch(&path).await.unwrap();

        backend.truncate("/app.log", 5);
        match watcher.poll_now(&path).await {
            PollReport::Updated(WatchUpdate {
                kind: WatchUpdateKind::FullReload { .. },
                ..
            }) => {}
            other => panic!("unexpected {other:?}"),
        }
        let state = watcher.watch_state(&path).unwrap();
        assert_eq!((state.last_size, state.last_read_position), (5, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_in_place_requests_full_reload() {
        let (backend, _time, watcher, path) = setup("abc\n");
        watcher.start_watch(&path).await.unwrap();

        backend.touch("/app.log");
        assert!(matches!(
            watcher.poll_now(&path).await,
            PollReport::Updated(WatchUpdate {
                kind: WatchUpdateKind::FullReload { .. },
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delta_read_falls_back_to_reload() {
        let (backend, _time, watcher, path) = setup("abc\n");
        watcher.start_watch(&path).await.unwrap();

        backend.set_fail_reads(true);
        backend.append("/app.log", "def\n");
        match watcher.poll_now(&path).await {
            PollReport::Updated(WatchUpdate {
                kind: WatchUpdateKind::FullReload { reason },
                ..
            }) => assert!(reason.contains("delta read failed")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_stops_watch() {
        let (backend, _time, watcher, path) = setup("x\n");
        watcher.start_watch(&path).await.unwrap();
        let mut events = watcher.subscribe();
        let initial = watcher.watch_state(&path).unwrap().current_interval;

        backend.fail_next_stats(10);
        assert!(matches!(
            watcher.poll_now(&path).await,
            PollReport::Retrying { retry_count: 1, .. }
        ));
        assert_eq!(
            watcher.watch_state(&path).unwrap().current_interval,
            initial * 2
        );
        assert!(matches!(
            watcher.poll_now(&path).await,
            PollReport::Retrying { retry_count: 2, .. }
        ));
        assert!(matches!(
            watcher.poll_now(&path).await,
            PollReport::Stopped { .. }
        ));

        assert!(!watcher.is_watching(&path));
        assert!(matches!(
            events.drain().as_slice(),
            [EngineEvent::WatchStopped { .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_retry_count() {
        let (backend, _time, watcher, path) = setup("x\n");
        watcher.start_watch(&path).await.unwrap();

        backend.fail_next_stats(1);
        watcher.poll_now(&path).await;
        assert_eq!(watcher.watch_state(&path).unwrap().retry_count, 1);
        watcher.poll_now(&path).await;
        let state = watcher.watch_state(&path).unwrap();
        assert_eq!(state.retry_count, 0);
        assert_eq!(state.stats.errors, 1);
        assert_eq!(state.stats.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_poll_is_noop() {
        let (backend, _time, watcher, path) = setup("x\n");
        watcher.start_watch(&path).await.unwrap();

        assert!(watcher.pause_watch(&path));
        backend.append("/app.log", "y\n");
        assert_eq!(watcher.poll_now(&path).await, PollReport::Paused);
        assert_eq!(watcher.watch_state(&path).unwrap().status, WatchStatus::Paused);

        assert!(watcher.resume_watch(&path));
        assert!(matches!(watcher.poll_now(&path).await, PollReport::Updated(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let (_backend, _time, watcher, path) = setup("x\n");
        watcher.start_watch(&path).await.unwrap();
        assert!(watcher.stop_watch(&path));
        assert!(!watcher.stop_watch(&path));
        assert_eq!(watcher.poll_now(&path).await, PollReport::NotWatched);
        assert!(!watcher.pause_watch(&path));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_previous_watch() {
        let (backend, _time, watcher, path) = setup("x\n");
        watcher.start_watch(&path).await.unwrap();
        backend.append("/app.log", "y\n");
        watcher.start_watch(&path).await.unwrap();

        assert_eq!(watcher.active_count(), 1);
        // The restart re-seeded at the new end, so nothing is pending
        assert_eq!(watcher.poll_now(&path).await, PollReport::Unchanged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_on_missing_path_fails() {
        let (_backend, _time, watcher, _path) = setup("x\n");
        let missing = RemotePath::local("/missing");
        let err = watcher.start_watch(&missing).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert!(!watcher.is_watching(&missing));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_delivers_updates() {
        let (backend, _time, watcher, path) = setup("x\n");
        let mut events = watcher.subscribe();
        watcher.start_watch(&path).await.unwrap();

        backend.append("/app.log", "y\n");
        let event = events.events.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::WatchUpdate(_)));
        watcher.stop_all();
    }

    #[test]
    fn test_interval_adapts_to_activity() {
        let cfg = config();
        let start = Instant::now();
        let mut state = WatchState::new(&cfg, start);
        state.seed(&RemoteStat::file(0));
        let wall = Utc::now();

        // Recent change: halve
        let effect = state.apply(
            PollOutcome::Appended {
                stat: RemoteStat::file(2),
                text: "a\n".into(),
                bytes_read: 2,
            },
            start + Duration::from_secs(1),
            wall,
            &cfg,
        );
        assert!(matches!(effect, WatchEffect::Emit(_)));
        assert_eq!(state.current_interval, Duration::from_millis(500));

        // Quiet for 30s: double
        state.apply(
            PollOutcome::Unchanged {
                stat: RemoteStat::file(2),
            },
            start + Duration::from_secs(40),
            wall,
            &cfg,
        );
        assert_eq!(state.current_interval, Duration::from_millis(1000));

        // In between: unchanged
        state.apply(
            PollOutcome::Unchanged {
                stat: RemoteStat::file(2),
            },
            start + Duration::from_secs(1) + Duration::from_secs(10),
            wall,
            &cfg,
        );
        assert_eq!(state.current_interval, Duration::from_millis(1000));
    }

    fn outcome_strategy() -> impl Strategy<Value = (u8, u64)> {
        (0u8..4, 0u64..120)
    }

    proptest! {
        #[test]
        fn prop_interval_stays_within_bounds(
            steps in prop::collection::vec(outcome_strategy(), 1..60),
            backoff in 0.1f64..8.0,
        ) {
            let cfg = WatchConfig {
                backoff_factor: backoff,
                max_retries: 1000,
                ..WatchConfig::default()
            };
            let start = Instant::now();
            let mut state = WatchState::new(&cfg, start);
            state.seed(&RemoteStat::file(0));
            let mut now = start;
            let mut size = 0u64;

            for (kind, advance_secs) in steps {
                now += Duration::from_secs(advance_secs);
                let outcome = match kind {
                    0 => PollOutcome::Unchanged { stat: RemoteStat::file(size) },
                    1 => {
                        size += 2;
                        PollOutcome::Appended { stat: RemoteStat::file(size), text: "z\n".into(), bytes_read: 2 }
                    }
                    2 => PollOutcome::Rewritten { stat: RemoteStat::file(size), reason: "r".into() },
                    _ => PollOutcome::StatFailed {
                        error: EngineError::unknown("stat", &RemotePath::local("/p"), "down"),
                    },
                };
                state.apply(outcome, now, Utc::now(), &cfg);
                prop_assert!(state.current_interval >= cfg.min_interval);
                prop_assert!(state.current_interval <= cfg.max_interval);
            }
        }
    }
}
