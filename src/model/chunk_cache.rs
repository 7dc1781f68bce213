//! Bounded cache of fetched line windows.
//!
//! Windows are keyed by half-open line ranges. When the cache grows past its
//! bound, the window with the lowest recency/frequency score is dropped:
//!
//! ```text
//! score = last_accessed_ms + access_count * access_weight_ms
//! ```
//!
//! where `last_accessed_ms` is measured from the cache's creation. Equal
//! scores evict the window inserted first. Content is only ever handed out as
//! owned copies, so callers can never observe a window mid-update.

use std::collections::HashMap;
use std::ops::Range;
use std::time::Instant;

use crate::services::time_source::{RealTimeSource, SharedTimeSource};

/// Identifies a window by its line range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowKey {
    pub start: usize,
    pub end: usize,
}

impl WindowKey {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end, "inverted window {start}..{end}");
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }
}

impl From<Range<usize>> for WindowKey {
    fn from(range: Range<usize>) -> Self {
        Self::new(range.start, range.end)
    }
}

#[derive(Debug, Clone)]
struct Window {
    lines: Vec<String>,
    last_accessed: Instant,
    access_count: u64,
    /// Insertion sequence number, breaks score ties
    seq: u64,
}

#[derive(Debug)]
pub struct ChunkCache {
    windows: HashMap<WindowKey, Window>,
    max_windows: usize,
    access_weight_ms: u64,
    next_seq: u64,
    epoch: Instant,
    time: SharedTimeSource,
}

impl ChunkCache {
    pub fn new(max_windows: usize, access_weight_ms: u64) -> Self {
        Self::with_time_source(max_windows, access_weight_ms, RealTimeSource::shared())
    }

    /// `max_windows` of zero is clamped to one.
    pub fn with_time_source(
        max_windows: usize,
        access_weight_ms: u64,
        time: SharedTimeSource,
    ) -> Self {
        Self {
            windows: HashMap::new(),
            max_windows: max_windows.max(1),
            access_weight_ms,
            next_seq: 0,
            epoch: time.now(),
            time,
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn max_windows(&self) -> usize {
        self.max_windows
    }

    pub fn contains(&self, key: &WindowKey) -> bool {
        self.windows.contains_key(key)
    }

    /// Cached keys in line order
    pub fn keys(&self) -> Vec<WindowKey> {
        let mut keys: Vec<_> = self.windows.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Copy of a window's lines. Does not count as an access.
    pub fn get(&self, key: &WindowKey) -> Option<Vec<String>> {
        self.windows.get(key).map(|w| w.lines.clone())
    }

    /// Record an access to a cached window. Returns false on miss.
    pub fn touch(&mut self, key: &WindowKey) -> bool {
        let now = self.time.now();
        match self.windows.get_mut(key) {
            Some(window) => {
                window.last_accessed = now;
                window.access_count += 1;
                true
            }
            None => false,
        }
    }

    /// Insert or replace a window, returning the keys evicted to stay in bounds.
    pub fn put(&mut self, key: WindowKey, lines: Vec<String>) -> Vec<WindowKey> {
        let now = self.time.now();
        if let Some(window) = self.windows.get_mut(&key) {
            window.lines = lines;
            window.last_accessed = now;
            window.access_count += 1;
            return Vec::new();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.windows.insert(
            key,
            Window {
                lines,
                last_accessed: now,
                access_count: 1,
                seq,
            },
        );

        let mut evicted = Vec::new();
        while self.windows.len() > self.max_windows {
            match self.lowest_scored(Some(&key)) {
                Some(victim) => {
                    self.windows.remove(&victim);
                    tracing::debug!("Evicted window {}..{}", victim.start, victim.end);
                    evicted.push(victim);
                }
                None => break,
            }
        }
        evicted
    }

    /// Re-key a window to cover `appended` extra lines at its end.
    ///
    /// Returns the new key, or `None` when the window is not cached.
    pub fn extend(&mut self, key: &WindowKey, appended: Vec<String>) -> Option<WindowKey> {
        let mut window = self.windows.remove(key)?;
        let new_key = WindowKey::new(key.start, key.end + appended.len());
        window.lines.extend(appended);
        window.last_accessed = self.time.now();
        self.windows.insert(new_key, window);
        Some(new_key)
    }

    pub fn remove(&mut self, key: &WindowKey) -> bool {
        self.windows.remove(key).is_some()
    }

    /// Drop every window (encoding change, truncation, filter change).
    pub fn invalidate_all(&mut self) {
        if !self.windows.is_empty() {
            tracing::debug!("Invalidating {} cached windows", self.windows.len());
        }
        self.windows.clear();
    }

    fn score(&self, window: &Window) -> u64 {
        let age_ms = window
            .last_accessed
            .saturating_duration_since(self.epoch)
            .as_millis() as u64;
        age_ms.saturating_add(window.access_count.saturating_mul(self.access_weight_ms))
    }

    fn lowest_scored(&self, exclude: Option<&WindowKey>) -> Option<WindowKey> {
        self.windows
            .iter()
            .filter(|(key, _)| Some(*key) != exclude)
            .min_by_key(|(_, window)| (self.score(window), window.seq))
            .map(|(key, _)| *key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::time_source::TestTimeSource;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn lines(tag: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{tag}-{i}")).collect()
    }

    fn cache_with_clock(max: usize, weight: u64) -> (ChunkCache, Arc<TestTimeSource>) {
        let clock = TestTimeSource::shared();
        (ChunkCache::with_time_source(max, weight, clock.clone()), clock)
    }

    #[test]
    fn test_get_after_put_returns_content() {
        let (mut cache, _) = cache_with_clock(4, 1000);
        let key = WindowKey::new(0, 3);
        cache.put(key, lines("a", 3));
        assert_eq!(cache.get(&key), Some(lines("a", 3)));
        assert_eq!(cache.get(&WindowKey::new(3, 6)), None);
    }

    #[test]
    fn test_miss_has_no_side_effects() {
        let (mut cache, _) = cache_with_clock(2, 1000);
        assert!(cache.get(&WindowKey::new(0, 1)).is_none());
        assert!(!cache.touch(&WindowKey::new(0, 1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evicts_oldest_when_untouched() {
        let (mut cache, clock) = cache_with_clock(2, 0);
        cache.put(WindowKey::new(0, 10), lines("a", 10));
        clock.advance(Duration::from_millis(10));
        cache.put(WindowKey::new(10, 20), lines("b", 10));
        clock.advance(Duration::from_millis(10));

        let evicted = cache.put(WindowKey::new(20, 30), lines("c", 10));

        assert_eq!(evicted, vec![WindowKey::new(0, 10)]);
        assert_eq!(cache.keys(), vec![WindowKey::new(10, 20), WindowKey::new(20, 30)]);
    }

    #[test]
    fn test_frequently_used_window_survives() {
        let (mut cache, clock) = cache_with_clock(2, 1000);
        let hot = WindowKey::new(0, 10);
        cache.put(hot, lines("hot", 10));
        for _ in 0..5 {
            cache.touch(&hot);
        }
        clock.advance(Duration::from_millis(500));
        cache.put(WindowKey::new(10, 20), lines("cold", 10));
        clock.advance(Duration::from_millis(500));

        let evicted = cache.put(WindowKey::new(20, 30), lines("new", 10));

        assert_eq!(evicted, vec![WindowKey::new(10, 20)]);
        assert!(cache.contains(&hot));
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let (mut cache, _) = cache_with_clock(3, 1000);
        cache.put(WindowKey::new(20, 30), lines("first", 1));
        cache.put(WindowKey::new(0, 10), lines("second", 1));
        cache.put(WindowKey::new(10, 20), lines("third", 1));

        let evicted = cache.put(WindowKey::new(30, 40), lines("fourth", 1));
        assert_eq!(evicted, vec![WindowKey::new(20, 30)]);
    }

    #[test]
    fn test_new_window_is_never_its_own_victim() {
        let (mut cache, clock) = cache_with_clock(1, 1000);
        let old = WindowKey::new(0, 1);
        cache.put(old, lines("old", 1));
        for _ in 0..100 {
            cache.touch(&old);
        }
        clock.advance(Duration::from_millis(1));

        let fresh = WindowKey::new(1, 2);
        assert_eq!(cache.put(fresh, lines("fresh", 1)), vec![old]);
        assert_eq!(cache.get(&fresh), Some(lines("fresh", 1)));
    }

    #[test]
    fn test_replace_keeps_single_entry() {
        let (mut cache, _) = cache_with_clock(2, 1000);
        let key = WindowKey::new(0, 2);
        cache.put(key, lines("v1", 2));
        assert!(cache.put(key, lines("v2", 2)).is_empty());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key), Some(lines("v2", 2)));
    }

    #[test]
    fn test_extend_rekeys_window() {
        let (mut cache, _) = cache_with_clock(2, 1000);
        let key = WindowKey::new(1000, 1002);
        cache.put(key, lines("t", 2));

        let new_key = cache
            .extend(&key, vec!["x".to_string(), "y".to_string()])
            .unwrap();

        assert_eq!(new_key, WindowKey::new(1000, 1004));
        assert!(!cache.contains(&key));
        assert_eq!(cache.get(&new_key).unwrap().len(), 4);
        assert!(cache.extend(&key, vec![]).is_none());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let (mut cache, _) = cache_with_clock(0, 1000);
        cache.put(WindowKey::new(0, 1), lines("a", 1));
        cache.put(WindowKey::new(1, 2), lines("b", 1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.max_windows(), 1);
    }

    proptest! {
        #[test]
        fn prop_bound_and_read_your_write(
            max in 1usize..6,
            ops in prop::collection::vec((0usize..12, any::<bool>(), 0u64..50), 1..80),
        ) {
            let (mut cache, clock) = cache_with_clock(max, 100);
            for (block, is_put, advance) in ops {
                clock.advance(Duration::from_millis(advance));
                let key = WindowKey::new(block * 10, block * 10 + 10);
                if is_put {
                    let content = lines(&format!("b{block}-{advance}"), 3);
                    cache.put(key, content.clone());
                    prop_assert_eq!(cache.get(&key), Some(content));
                } else if cache.get(&key).is_some() {
                    cache.touch(&key);
                }
                prop_assert!(cache.len() <= max);
            }
        }
    }
}
