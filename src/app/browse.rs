//! Windowed ("browse") access to one remote file.
//!
//! Lines are fetched through the `ExternalLineTool` in windows and kept in a
//! `ChunkCache`; the `VirtualScroller` decides which blocks a viewport needs.
//! Filter and search always rescan the whole remote file.
//!
//! Concurrency rules:
//! - concurrent `load_range` calls for the same window share one fetch;
//! - a new filter (or search) supersedes the one in flight: its process is
//!   killed and its late result is reported as `Superseded` without touching
//!   state or emitting events;
//! - anything fetched before an invalidation (reload, encoding or filter
//!   change) is handed to its callers but never cached.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::BrowseConfig;
use crate::error::{EngineError, EngineResult};
use crate::event::{EngineEvent, EventBus, EventSource, Subscription};
use crate::model::chunk_cache::{ChunkCache, WindowKey};
use crate::model::pattern::{
    parse_numbered_output, search_matches, CompiledPattern, FilterState, NumberedLine,
    PatternSpec, SearchMatch, SearchState,
};
use crate::services::file_watcher::{WatchUpdate, WatchUpdateKind};
use crate::services::line_tool::{ExternalLineTool, LineQuery, LineRequest};
use crate::services::remote::RemotePath;
use crate::services::time_source::{RealTimeSource, SharedTimeSource};
use crate::view::virtual_scroll::{ScrollState, VirtualScroller};

/// Lines taken from a follow stream per state update
const TAIL_BATCH: usize = 256;

type Waiters = Vec<oneshot::Sender<EngineResult<Vec<String>>>>;

/// Scroll schedule plus the lines now visible
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollView {
    pub state: ScrollState,
    pub lines: Vec<NumberedLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterResult {
    pub lines: Vec<NumberedLine>,
    pub matched_count: usize,
    pub total_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    /// An empty pattern removed the filter
    Cleared,
    Applied(FilterResult),
}

struct BrowseState {
    cache: ChunkCache,
    scroller: VirtualScroller,
    total_lines: Option<usize>,
    encoding: String,
    filter: Option<FilterState>,
    search: Option<SearchState>,
    /// Bumped on every invalidation; fetches started under an older epoch
    /// are not cached
    epoch: u64,
    filter_generation: u64,
    filter_cancel: Option<oneshot::Sender<()>>,
    search_generation: u64,
    search_cancel: Option<oneshot::Sender<()>>,
    tail_generation: u64,
}

impl BrowseState {
    fn invalidate(&mut self) {
        self.epoch += 1;
        self.cache.invalidate_all();
        self.scroller.reset();
    }

    fn cancel_filter(&mut self) {
        self.filter_generation += 1;
        if let Some(cancel) = self.filter_cancel.take() {
            let _ = cancel.send(());
        }
    }

    fn cancel_search(&mut self) {
        self.search_generation += 1;
        if let Some(cancel) = self.search_cancel.take() {
            let _ = cancel.send(());
        }
    }
}

struct BrowseInner {
    path: RemotePath,
    tool: Arc<dyn ExternalLineTool>,
    state: Mutex<BrowseState>,
    pending: Mutex<HashMap<WindowKey, Waiters>>,
    tail: Mutex<Option<JoinHandle<()>>>,
    bus: Arc<EventBus>,
}

impl Drop for BrowseInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.tail).take() {
            task.abort();
        }
    }
}

/// Windowed reader for one remote file; cheap to clone
#[derive(Clone)]
pub struct BrowseEngine {
    inner: Arc<BrowseInner>,
}

impl std::fmt::Debug for BrowseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowseEngine")
            .field("path", &self.inner.path)
            .field("tool", &"<dyn ExternalLineTool>")
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Leader side of a coalesced fetch. If the leader is dropped before it
/// finishes, its waiters are released and retry the fetch themselves.
struct PendingFetch<'a> {
    pending: &'a Mutex<HashMap<WindowKey, Waiters>>,
    key: WindowKey,
    finished: bool,
}

impl PendingFetch<'_> {
    fn finish(mut self) -> Waiters {
        self.finished = true;
        lock(self.pending).remove(&self.key).unwrap_or_default()
    }
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        if !self.finished {
            lock(self.pending).remove(&self.key);
        }
    }
}

impl BrowseEngine {
    pub fn new(path: RemotePath, tool: Arc<dyn ExternalLineTool>, config: &BrowseConfig) -> Self {
        Self::with_time_source(path, tool, config, RealTimeSource::shared())
    }

    pub fn with_time_source(
        path: RemotePath,
        tool: Arc<dyn ExternalLineTool>,
        config: &BrowseConfig,
        time: SharedTimeSource,
    ) -> Self {
        let state = BrowseState {
            cache: ChunkCache::with_time_source(
                config.max_cached_windows,
                config.cache_access_weight_ms,
                time,
            ),
            scroller: VirtualScroller::new(
                config.block_size,
                config.preload_blocks,
                config.line_height,
            ),
            total_lines: None,
            encoding: "utf-8".to_string(),
            filter: None,
            search: None,
            epoch: 0,
            filter_generation: 0,
            filter_cancel: None,
            search_generation: 0,
            search_cancel: None,
            tail_generation: 0,
        };
        Self {
            inner: Arc::new(BrowseInner {
                path,
                tool,
                state: Mutex::new(state),
                pending: Mutex::new(HashMap::new()),
                tail: Mutex::new(None),
                bus: EventBus::shared(EventSource::Browse),
            }),
        }
    }

    pub fn path(&self) -> &RemotePath {
        &self.inner.path
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        self.inner.bus.emit(event);
    }

    fn state(&self) -> MutexGuard<'_, BrowseState> {
        lock(&self.inner.state)
    }

    /// Keys of the windows currently cached, in line order
    pub fn cached_windows(&self) -> Vec<WindowKey> {
        self.state().cache.keys()
    }

    pub fn encoding(&self) -> String {
        self.state().encoding.clone()
    }

    /// Switch the text encoding; cached content no longer applies.
    pub fn set_encoding(&self, encoding: &str) {
        let mut state = self.state();
        if state.encoding != encoding {
            state.encoding = encoding.to_string();
            state.invalidate();
        }
    }

    /// Lines `[start, end)`, from the cache or a single fetch.
    ///
    /// When the line count is known, `end` is clamped to it.
    pub async fn load_range(&self, start: usize, end: usize) -> EngineResult<Vec<String>> {
        let key = {
            let state = self.state();
            let end = state.total_lines.map_or(end, |total| end.min(total));
            WindowKey::new(start.min(end), end)
        };
        if key.is_empty() {
            return Ok(Vec::new());
        }

        loop {
            let waiter = {
                let mut pending = lock(&self.inner.pending);
                let mut state = self.state();
                if state.cache.touch(&key) {
                    if let Some(lines) = state.cache.get(&key) {
                        tracing::debug!("Cache hit for {}..{}", key.start, key.end);
                        return Ok(lines);
                    }
                }
                drop(state);

                match pending.get_mut(&key) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        pending.insert(key, Vec::new());
                        None
                    }
                }
            };

            match waiter {
                Some(rx) => match rx.await {
                    Ok(result) => return result,
                    // Leader went away without an answer
                    Err(_) => continue,
                },
                None => return self.fetch_window(key).await,
            }
        }
    }

    async fn fetch_window(&self, key: WindowKey) -> EngineResult<Vec<String>> {
        let guard = PendingFetch {
            pending: &self.inner.pending,
            key,
            finished: false,
        };
        let (epoch, encoding) = {
            let state = self.state();
            (state.epoch, state.encoding.clone())
        };
        tracing::debug!("Fetching window {}..{} of {}", key.start, key.end, self.inner.path);

        let request = LineRequest::new(
            self.inner.path.clone(),
            LineQuery::Range {
                start: key.start,
                end: key.end,
            },
        )
        .with_encoding(encoding);
        let result = self.inner.tool.run(&request).await.map(|out| out.lines());

        if let Ok(lines) = &result {
            let mut state = self.state();
            if state.epoch == epoch {
                state.cache.put(key, lines.clone());
            }
        }

        for waiter in guard.finish() {
            let _ = waiter.send(result.clone());
        }

        if let Ok(lines) = &result {
            self.emit(EngineEvent::WindowLoaded {
                range: key.range(),
                lines: lines.clone(),
            });
        }
        result
    }

    /// Total number of lines, counted once and then cached.
    pub async fn total_line_count(&self) -> EngineResult<usize> {
        let (epoch, encoding) = {
            let state = self.state();
            if let Some(total) = state.total_lines {
                return Ok(total);
            }
            (state.epoch, state.encoding.clone())
        };

        let request =
            LineRequest::new(self.inner.path.clone(), LineQuery::CountLines).with_encoding(encoding);
        let output = self.inner.tool.run(&request).await?;
        let total = output.line_count()?;

        let mut state = self.state();
        if state.epoch == epoch {
            state.total_lines = Some(total);
            state.scroller.set_total_lines(total);
        }
        Ok(total)
    }

    fn block_range(&self, block: usize) -> Range<usize> {
        self.state().scroller.block_range(block)
    }

    /// Move the viewport: evict blocks no longer needed, load the new ones,
    /// and return the visible lines of the raw file.
    pub async fn scroll_to(
        &self,
        scroll_offset: f64,
        container_height: f64,
    ) -> EngineResult<ScrollView> {
        let total = self.total_line_count().await?;
        let schedule = {
            let mut state = self.state();
            state.scroller.set_total_lines(total);
            let schedule = state.scroller.calculate_scroll_state(scroll_offset, container_height);
            for block in &schedule.windows_to_evict {
                let key = WindowKey::from(state.scroller.block_range(*block));
                state.cache.remove(&key);
            }
            schedule
        };

        let mut first_error = None;
        for block in &schedule.windows_to_load {
            let range = self.block_range(*block);
            if let Err(e) = self.load_range(range.start, range.end).await {
                self.state().scroller.mark_failed(*block);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let lines = self.raw_lines(&schedule.visible_range).await?;
        Ok(ScrollView {
            state: schedule,
            lines,
        })
    }

    /// Numbered raw lines, assembled from block-aligned windows
    async fn raw_lines(&self, range: &Range<usize>) -> EngineResult<Vec<NumberedLine>> {
        let blocks = self.state().scroller.blocks_for(range);
        let mut out = Vec::with_capacity(range.len());
        for block in blocks {
            let block_range = self.block_range(block);
            let lines = self.load_range(block_range.start, block_range.end).await?;
            for (offset, text) in lines.into_iter().enumerate() {
                let line = block_range.start + offset;
                if range.contains(&line) {
                    out.push(NumberedLine::new(line, text));
                }
            }
        }
        Ok(out)
    }

    /// Filter with the plain arguments of the public contract.
    pub async fn apply_filter(
        &self,
        pattern: &str,
        is_regex: bool,
        case_sensitive: bool,
    ) -> EngineResult<FilterOutcome> {
        let spec = if is_regex {
            PatternSpec::regex(pattern)
        } else {
            PatternSpec::literal(pattern)
        };
        self.apply_filter_spec(spec.case_sensitive(case_sensitive))
            .await
    }

    /// Replace the active filter with `spec`, rescanning the whole file.
    ///
    /// An empty pattern clears the filter. An invalid pattern fails with
    /// `EngineError::Pattern` and leaves the current filter in place.
    pub async fn apply_filter_spec(&self, spec: PatternSpec) -> EngineResult<FilterOutcome> {
        if spec.is_empty() {
            self.clear_filter();
            return Ok(FilterOutcome::Cleared);
        }
        let compiled = match spec.compile() {
            Ok(compiled) => compiled,
            Err(e) => {
                self.emit(EngineEvent::FilterError {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let (generation, cancel) = {
            let mut state = self.state();
            state.cancel_filter();
            let (tx, rx) = oneshot::channel();
            state.filter_cancel = Some(tx);
            (state.filter_generation, rx)
        };

        let scanned = async {
            let total = self.total_line_count().await?;
            let matched = self.scan(&compiled, cancel, "filter").await?;
            Ok::<_, EngineError>((total, matched))
        }
        .await;

        let mut state = self.state();
        if state.filter_generation != generation {
            return Err(EngineError::Superseded {
                operation: "filter",
            });
        }
        state.filter_cancel = None;

        match scanned {
            Ok((total_count, matched)) => {
                let result = FilterResult {
                    lines: matched.clone(),
                    matched_count: matched.len(),
                    total_count,
                };
                state.filter = Some(FilterState {
                    compiled,
                    matched,
                    total_count,
                });
                state.invalidate();
                drop(state);

                tracing::info!(
                    "Filter {:?} matched {} of {} lines",
                    spec.pattern,
                    result.matched_count,
                    result.total_count
                );
                self.emit(EngineEvent::FilterCompleted {
                    matched_count: result.matched_count,
                    total_count: result.total_count,
                });
                Ok(FilterOutcome::Applied(result))
            }
            Err(e) => {
                drop(state);
                self.emit(EngineEvent::FilterError {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Remove the active filter, cancelling one in flight.
    ///
    /// Returns whether a filter was active.
    pub fn clear_filter(&self) -> bool {
        let was_active = {
            let mut state = self.state();
            state.cancel_filter();
            let was_active = state.filter.take().is_some();
            if was_active {
                state.invalidate();
            }
            was_active
        };
        self.emit(EngineEvent::FilterCleared);
        was_active
    }

    /// Pattern and counts of the active filter
    pub fn active_filter(&self) -> Option<(PatternSpec, usize, usize)> {
        self.state().filter.as_ref().map(|f| {
            (
                f.compiled.spec().clone(),
                f.matched_count(),
                f.total_count,
            )
        })
    }

    /// All matches of `spec` in the file, in file order.
    pub async fn search(&self, spec: PatternSpec) -> EngineResult<Vec<SearchMatch>> {
        let compiled = match spec.compile() {
            Ok(compiled) => compiled,
            Err(e) => {
                self.emit(EngineEvent::SearchError {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let (generation, cancel) = {
            let mut state = self.state();
            state.cancel_search();
            let (tx, rx) = oneshot::channel();
            state.search_cancel = Some(tx);
            (state.search_generation, rx)
        };

        let scanned = self.scan(&compiled, cancel, "search").await;

        let mut state = self.state();
        if state.search_generation != generation {
            return Err(EngineError::Superseded {
                operation: "search",
            });
        }
        state.search_cancel = None;

        match scanned {
            Ok(lines) => {
                let results = search_matches(&compiled, &lines);
                state.search = Some(SearchState {
                    spec,
                    result_count: results.len(),
                });
                drop(state);
                self.emit(EngineEvent::SearchCompleted {
                    results: results.clone(),
                });
                Ok(results)
            }
            Err(e) => {
                drop(state);
                self.emit(EngineEvent::SearchError {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn clear_search(&self) {
        let mut state = self.state();
        state.cancel_search();
        state.search = None;
    }

    pub fn search_state(&self) -> Option<SearchState> {
        self.state().search.clone()
    }

    /// Run a remote match scan, verifying each selected line locally.
    ///
    /// Resolving `cancel` kills the scan.
    async fn scan(
        &self,
        compiled: &CompiledPattern,
        cancel: oneshot::Receiver<()>,
        operation: &'static str,
    ) -> EngineResult<Vec<NumberedLine>> {
        let request = LineRequest::new(
            self.inner.path.clone(),
            LineQuery::Match(compiled.spec().clone()),
        )
        .with_encoding(self.encoding());
        let output = tokio::select! {
            result = self.inner.tool.run(&request) => result?,
            _ = cancel => return Err(EngineError::Superseded { operation }),
        };
        Ok(parse_numbered_output(&output.stdout)
            .into_iter()
            .filter(|line| compiled.is_match(&line.text))
            .collect())
    }

    /// Number of lines in the current view (filtered or raw)
    pub async fn view_line_count(&self) -> EngineResult<usize> {
        if let Some(count) = self.state().filter.as_ref().map(|f| f.matched_count()) {
            return Ok(count);
        }
        self.total_line_count().await
    }

    /// Lines `[start, end)` of the current view, numbered with their file line.
    pub async fn view_range(&self, start: usize, end: usize) -> EngineResult<Vec<NumberedLine>> {
        let filtered = self.state().filter.as_ref().map(|f| {
            let end = end.min(f.matched.len());
            f.matched[start.min(end)..end].to_vec()
        });
        if let Some(lines) = filtered {
            return Ok(lines);
        }

        let lines = self.load_range(start, end).await?;
        Ok(lines
            .into_iter()
            .enumerate()
            .map(|(offset, text)| NumberedLine::new(start + offset, text))
            .collect())
    }

    /// Forget everything derived from the file's previous content.
    pub fn reload(&self) {
        let had_filter = {
            let mut state = self.state();
            state.invalidate();
            state.total_lines = None;
            state.cancel_filter();
            state.cancel_search();
            state.search = None;
            state.filter.take().is_some()
        };
        tracing::info!("Reloading {}", self.inner.path);
        if had_filter {
            self.emit(EngineEvent::FilterCleared);
        }
    }

    /// Append lines observed at the end of the file.
    ///
    /// The last window (the one ending at the current line count) grows in
    /// place and an active filter absorbs matching lines. Ignored while the
    /// line count is unknown; the next count includes them.
    pub fn append_lines(&self, lines: Vec<String>) {
        let mut state = self.state();
        self.append_locked(&mut state, lines);
    }

    fn append_locked(&self, state: &mut BrowseState, lines: Vec<String>) {
        if lines.is_empty() {
            return;
        }
        let Some(total) = state.total_lines else {
            tracing::debug!("Dropping {} appended lines, line count unknown", lines.len());
            return;
        };

        let first_line = total;
        let count = lines.len();
        let filter_counts = state.filter.as_mut().and_then(|filter| {
            (filter.absorb(first_line, &lines) > 0)
                .then(|| (filter.matched_count(), filter.total_count))
        });

        // The window ending at the old end grows, but never past its block
        let block_size = state.scroller.block_size().max(1);
        let last = state.cache.keys().into_iter().find(|k| k.end == total);
        if let Some(key) = last {
            let block_end = (key.start / block_size + 1) * block_size;
            let room = block_end.saturating_sub(key.end).min(count);
            if room > 0 {
                state.cache.extend(&key, lines[..room].to_vec());
            }
        }
        state.total_lines = Some(total + count);
        state.scroller.set_total_lines(total + count);

        // Emitted under the state lock so nothing fires after a stop
        self.emit(EngineEvent::LinesAppended { first_line, count });
        if let Some((matched_count, total_count)) = filter_counts {
            self.emit(EngineEvent::FilterCompleted {
                matched_count,
                total_count,
            });
        }
    }

    /// Feed a watcher update for this file. Returns false for other paths.
    pub fn apply_watch_update(&self, update: &WatchUpdate) -> bool {
        if update.path != self.inner.path {
            return false;
        }
        match &update.kind {
            WatchUpdateKind::Incremental { lines, .. } => self.append_lines(lines.clone()),
            WatchUpdateKind::FullReload { reason } => {
                tracing::info!("Full reload of {}: {}", self.inner.path, reason);
                self.reload();
            }
        }
        true
    }

    /// Follow lines appended to the file. No-op if already tailing.
    pub async fn start_tail(&self) -> EngineResult<()> {
        if self.is_tailing() {
            return Ok(());
        }
        let encoding = self.encoding();
        let mut stream = self.inner.tool.follow(&self.inner.path, &encoding).await?;
        let generation = {
            let mut state = self.state();
            state.tail_generation += 1;
            state.tail_generation
        };

        let weak: Weak<BrowseInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut batch = Vec::with_capacity(TAIL_BATCH);
            while stream.recv_many(&mut batch, TAIL_BATCH).await > 0 {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = BrowseEngine { inner };
                let lines = std::mem::take(&mut batch);
                let mut state = engine.state();
                if state.tail_generation != generation {
                    break;
                }
                engine.append_locked(&mut state, lines);
            }
        });

        if let Some(previous) = lock(&self.inner.tail).replace(task) {
            previous.abort();
        }
        tracing::info!("Tailing {}", self.inner.path);
        Ok(())
    }

    /// Stop following. Returns false if not tailing.
    pub fn stop_tail(&self) -> bool {
        self.state().tail_generation += 1;
        match lock(&self.inner.tail).take() {
            Some(task) => {
                let was_running = !task.is_finished();
                task.abort();
                was_running
            }
            None => false,
        }
    }

    pub fn is_tailing(&self) -> bool {
        lock(&self.inner.tail)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}
