//! Arbitration between windowed and full-load access to one file.
//!
//! The manager owns one `BrowseEngine` and one `EditEngine` for a path and
//! decides which of them is live. Both engine buses relay into the manager's
//! bus through a shared `ForwardGate`, so switching which engine clients hear
//! from is one atomic store.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::app::browse::BrowseEngine;
use crate::app::edit::{EditEngine, EditOptions};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::event::{EngineEvent, EventBus, EventSource, ForwardGate, Subscription};
use crate::services::file_watcher::{FileWatcher, WatchUpdate, WatchUpdateKind};
use crate::services::line_tool::ExternalLineTool;
use crate::services::remote::{with_deadline, RemoteFileService, RemotePath};
use crate::services::time_source::{RealTimeSource, SharedTimeSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Browse,
    Edit,
}

impl Mode {
    fn source(self) -> EventSource {
        match self {
            Mode::Browse => EventSource::Browse,
            Mode::Edit => EventSource::Edit,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Browse => write!(f, "browse"),
            Mode::Edit => write!(f, "edit"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModeTransition {
    pub from: Mode,
    pub to: Mode,
    pub started_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModeState {
    Browse,
    Edit,
    Switching(ModeTransition),
}

impl ModeState {
    fn settled(mode: Mode) -> Self {
        match mode {
            Mode::Browse => ModeState::Browse,
            Mode::Edit => ModeState::Edit,
        }
    }
}

/// What to do with unsaved edit-mode content when leaving edit mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirtyResolution {
    /// Leave only if there is nothing to lose
    #[default]
    Refuse,
    Save,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched(Mode),
    AlreadyInMode,
    /// Edit content is dirty and no resolution was given; nothing changed
    ConfirmationRequired,
}

#[derive(Debug, Clone)]
struct ModeOptions {
    large_file_threshold_bytes: u64,
    remote_timeout: Duration,
    autosave_interval: Option<Duration>,
}

struct ModeInner {
    path: RemotePath,
    remote: Arc<dyn RemoteFileService>,
    browse: BrowseEngine,
    edit: EditEngine,
    gate: Arc<ForwardGate>,
    bus: Arc<EventBus>,
    state: Mutex<ModeState>,
    options: ModeOptions,
    time: SharedTimeSource,
}

/// Browse/edit coordinator for one remote file; cheap to clone
#[derive(Clone)]
pub struct ModeManager {
    inner: Arc<ModeInner>,
}

impl fmt::Debug for ModeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModeManager")
            .field("path", &self.inner.path)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Puts the manager back into `from` unless the switch was committed.
///
/// Held across every await of a switch, so a switch that fails or whose
/// future is dropped part way leaves the previous mode in place.
struct SwitchGuard<'a> {
    manager: &'a ModeManager,
    from: Mode,
    to: Mode,
    settled: bool,
}

impl<'a> SwitchGuard<'a> {
    fn commit(mut self) -> SwitchOutcome {
        self.settled = true;
        let inner = &self.manager.inner;
        {
            let mut state = lock(&inner.state);
            inner.gate.point_to(self.to.source());
            *state = ModeState::settled(self.to);
        }
        tracing::info!("{} is now in {} mode", inner.path, self.to);
        inner.bus.emit(EngineEvent::ModeChanged { mode: self.to });
        SwitchOutcome::Switched(self.to)
    }

    /// Restore the previous mode without reporting a failure.
    fn abandon(mut self) {
        self.settled = true;
        self.restore();
    }

    fn fail(mut self, error: &EngineError) {
        self.settled = true;
        self.restore();
        self.report(error.to_string());
    }

    fn restore(&self) {
        let inner = &self.manager.inner;
        let mut state = lock(&inner.state);
        inner.gate.point_to(self.from.source());
        *state = ModeState::settled(self.from);
    }

    fn report(&self, reason: String) {
        let inner = &self.manager.inner;
        tracing::warn!(
            "Switching {} to {} mode failed: {}",
            inner.path,
            self.to,
            reason
        );
        inner.bus.emit(EngineEvent::ModeSwitchFailed {
            target: self.to,
            reason,
        });
    }
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.restore();
            self.report("switch was cancelled".to_string());
        }
    }
}

impl ModeManager {
    pub fn new(
        path: RemotePath,
        remote: Arc<dyn RemoteFileService>,
        tool: Arc<dyn ExternalLineTool>,
        config: &Config,
    ) -> Self {
        Self::with_time_source(path, remote, tool, config, RealTimeSource::shared())
    }

    pub fn with_time_source(
        path: RemotePath,
        remote: Arc<dyn RemoteFileService>,
        tool: Arc<dyn ExternalLineTool>,
        config: &Config,
        time: SharedTimeSource,
    ) -> Self {
        let browse = BrowseEngine::with_time_source(path.clone(), tool, &config.browse, time.clone());
        browse.set_encoding(&config.encoding);
        let edit = EditEngine::new(
            path.clone(),
            remote.clone(),
            EditOptions {
                max_full_load_bytes: config.mode.max_full_load_bytes,
                remote_timeout: config.timeouts.remote(),
                encoding: config.encoding.clone(),
            },
        );

        let gate = Arc::new(ForwardGate::new(EventSource::Browse));
        let bus = EventBus::shared(EventSource::Manager);
        browse.events().relay_to(gate.clone(), bus.clone());
        edit.events().relay_to(gate.clone(), bus.clone());

        Self {
            inner: Arc::new(ModeInner {
                path,
                remote,
                browse,
                edit,
                gate,
                bus,
                state: Mutex::new(ModeState::Browse),
                options: ModeOptions {
                    large_file_threshold_bytes: config.mode.large_file_threshold_bytes,
                    remote_timeout: config.timeouts.remote(),
                    autosave_interval: config.edit.autosave_interval_ms.map(Duration::from_millis),
                },
                time,
            }),
        }
    }

    pub fn path(&self) -> &RemotePath {
        &self.inner.path
    }

    pub fn browse(&self) -> &BrowseEngine {
        &self.inner.browse
    }

    pub fn edit(&self) -> &EditEngine {
        &self.inner.edit
    }

    /// Events of the active engine plus mode and watch events
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    pub fn state(&self) -> ModeState {
        lock(&self.inner.state).clone()
    }

    /// Mode currently in effect; during a switch, the mode being left
    pub fn mode(&self) -> Mode {
        match &*lock(&self.inner.state) {
            ModeState::Browse => Mode::Browse,
            ModeState::Edit => Mode::Edit,
            ModeState::Switching(transition) => transition.from,
        }
    }

    pub fn is_switching(&self) -> bool {
        matches!(*lock(&self.inner.state), ModeState::Switching(_))
    }

    /// Pick the initial mode from the file size.
    ///
    /// Files above the large-file threshold stay in browse mode; anything
    /// else is loaded fully into edit mode.
    pub async fn open(&self) -> EngineResult<Mode> {
        let path = &self.inner.path;
        let stat = with_deadline(
            "stat",
            path,
            self.inner.options.remote_timeout,
            self.inner.remote.stat(path),
        )
        .await?;
        if stat.is_directory {
            return Err(EngineError::unknown("open", path, "is a directory"));
        }

        if stat.size > self.inner.options.large_file_threshold_bytes {
            tracing::info!(
                "Opening {} in browse mode ({} bytes > {} byte threshold)",
                path,
                stat.size,
                self.inner.options.large_file_threshold_bytes
            );
            return Ok(self.mode());
        }

        self.switch_to(Mode::Edit, DirtyResolution::Refuse).await?;
        Ok(self.mode())
    }

    /// Switch to `target`.
    ///
    /// `resolution` only matters when leaving edit mode with unsaved content.
    /// Fails with `SwitchInProgress` while another switch is running.
    pub async fn switch_to(
        &self,
        target: Mode,
        resolution: DirtyResolution,
    ) -> EngineResult<SwitchOutcome> {
        let from = {
            let mut state = lock(&self.inner.state);
            let from = match &*state {
                ModeState::Switching(transition) => {
                    return Err(EngineError::SwitchInProgress {
                        target: transition.to,
                    });
                }
                ModeState::Browse => Mode::Browse,
                ModeState::Edit => Mode::Edit,
            };
            if from == target {
                return Ok(SwitchOutcome::AlreadyInMode);
            }
            if target == Mode::Browse
                && resolution == DirtyResolution::Refuse
                && self.inner.edit.is_dirty()
            {
                return Ok(SwitchOutcome::ConfirmationRequired);
            }
            *state = ModeState::Switching(ModeTransition {
                from,
                to: target,
                started_at: self.inner.time.now(),
            });
            from
        };

        tracing::info!("Switching {} from {} to {} mode", self.inner.path, from, target);
        let guard = SwitchGuard {
            manager: self,
            from,
            to: target,
            settled: false,
        };

        match target {
            Mode::Edit => self.enter_edit(guard).await,
            Mode::Browse => self.enter_browse(guard, resolution).await,
        }
    }

    async fn enter_edit(&self, guard: SwitchGuard<'_>) -> EngineResult<SwitchOutcome> {
        let browse = &self.inner.browse;
        let edit = &self.inner.edit;

        let was_tailing = browse.stop_tail();
        if let Err(e) = edit.load().await {
            let e = match e {
                EngineError::FileTooLarge { path, size, limit } => {
                    EngineError::LoadTooLarge { path, size, limit }
                }
                other => other,
            };
            guard.fail(&e);
            if was_tailing {
                if let Err(tail_err) = browse.start_tail().await {
                    tracing::warn!("Could not resume tail on {}: {}", self.inner.path, tail_err);
                }
            }
            return Err(e);
        }

        if let Some(interval) = self.inner.options.autosave_interval {
            edit.start_autosave(interval);
        }
        Ok(guard.commit())
    }

    async fn enter_browse(
        &self,
        guard: SwitchGuard<'_>,
        resolution: DirtyResolution,
    ) -> EngineResult<SwitchOutcome> {
        let edit = &self.inner.edit;

        match resolution {
            DirtyResolution::Save => {
                if let Err(e) = edit.save().await {
                    guard.fail(&e);
                    return Err(e);
                }
            }
            DirtyResolution::Discard => edit.discard(),
            DirtyResolution::Refuse => {}
        }
        // Edited again while saving, or while a refusing switch was running
        if edit.is_dirty() && resolution != DirtyResolution::Discard {
            guard.abandon();
            return Ok(SwitchOutcome::ConfirmationRequired);
        }

        self.inner.browse.reload();
        edit.unload();
        Ok(guard.commit())
    }

    /// Route a watcher update to whichever engine is live.
    ///
    /// Incremental updates are skipped while browse mode tails the file,
    /// since the tail already delivers those lines. Returns false when the
    /// update was not applied.
    pub async fn apply_watch_update(&self, update: &WatchUpdate) -> EngineResult<bool> {
        if update.path != self.inner.path {
            return Ok(false);
        }
        let state = self.state();
        match state {
            ModeState::Browse => {
                let browse = &self.inner.browse;
                if matches!(update.kind, WatchUpdateKind::Incremental { .. }) && browse.is_tailing()
                {
                    return Ok(false);
                }
                Ok(browse.apply_watch_update(update))
            }
            ModeState::Edit => self.inner.edit.apply_watch_update(update).await,
            ModeState::Switching(transition) => {
                tracing::debug!(
                    "Ignoring watch update for {} during switch to {}",
                    self.inner.path,
                    transition.to
                );
                Ok(false)
            }
        }
    }

    /// Forward `watcher` events for this file onto the manager's bus and
    /// apply them to the live engine, until the manager is dropped.
    pub fn follow_watcher(&self, watcher: &FileWatcher) -> JoinHandle<()> {
        let Subscription { id, mut events } = watcher.subscribe();
        let watcher = watcher.clone();
        let weak: Weak<ModeInner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = ModeManager { inner };
                match &event {
                    EngineEvent::WatchUpdate(update) if update.path == manager.inner.path => {
                        manager.inner.bus.emit(event.clone());
                        if let Err(e) = manager.apply_watch_update(update).await {
                            tracing::warn!(
                                "Applying watch update to {} failed: {}",
                                manager.inner.path,
                                e
                            );
                        }
                    }
                    EngineEvent::WatchStopped { path, .. } if *path == manager.inner.path => {
                        manager.inner.bus.emit(event.clone());
                    }
                    _ => {}
                }
            }
            watcher.unsubscribe(id);
        })
    }
}
