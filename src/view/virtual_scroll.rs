//! Virtual-scroll block scheduling.
//!
//! Maps a pixel scroll position onto fixed-size line blocks and decides which
//! blocks must be fetched and which can be dropped. No I/O happens here; the
//! only state is the set of blocks the scroller believes are loaded.

use std::collections::BTreeSet;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq)]
pub struct ScrollState {
    pub scroll_offset: f64,
    /// Visible lines, half-open
    pub visible_range: Range<usize>,
    pub windows_to_load: BTreeSet<usize>,
    pub windows_to_evict: BTreeSet<usize>,
}

#[derive(Debug, Clone)]
pub struct VirtualScroller {
    block_size: usize,
    preload_blocks: usize,
    line_height: f64,
    total_lines: usize,
    loaded: BTreeSet<usize>,
}

impl VirtualScroller {
    /// `block_size` of zero is clamped to one; non-positive line heights to one.
    pub fn new(block_size: usize, preload_blocks: usize, line_height: f64) -> Self {
        Self {
            block_size: block_size.max(1),
            preload_blocks,
            line_height: if line_height > 0.0 { line_height } else { 1.0 },
            total_lines: 0,
            loaded: BTreeSet::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn total_lines(&self) -> usize {
        self.total_lines
    }

    /// Changes future scheduling only; loaded blocks stay tracked.
    pub fn set_total_lines(&mut self, total_lines: usize) {
        self.total_lines = total_lines;
    }

    pub fn block_count(&self) -> usize {
        self.total_lines.div_ceil(self.block_size)
    }

    /// Line range covered by `block`, clamped to the file
    pub fn block_range(&self, block: usize) -> Range<usize> {
        let start = (block * self.block_size).min(self.total_lines);
        let end = (start + self.block_size).min(self.total_lines);
        start..end
    }

    /// Blocks overlapping a line range
    pub fn blocks_for(&self, lines: &Range<usize>) -> Range<usize> {
        if lines.is_empty() {
            return 0..0;
        }
        lines.start / self.block_size..(lines.end - 1) / self.block_size + 1
    }

    pub fn loaded_blocks(&self) -> &BTreeSet<usize> {
        &self.loaded
    }

    /// Forget a block whose load failed so it is scheduled again.
    pub fn mark_failed(&mut self, block: usize) {
        self.loaded.remove(&block);
    }

    /// Forget every loaded block (file reloaded).
    pub fn reset(&mut self) {
        self.loaded.clear();
    }

    pub fn visible_range(&self, scroll_offset: f64, container_height: f64) -> Range<usize> {
        let offset = scroll_offset.max(0.0);
        let height = container_height.max(0.0);
        let start = ((offset / self.line_height).floor() as usize).min(self.total_lines);
        let end = (((offset + height) / self.line_height).ceil() as usize)
            .min(self.total_lines)
            .max(start);
        start..end
    }

    fn needed_blocks(&self, visible: &Range<usize>) -> BTreeSet<usize> {
        let block_count = self.block_count();
        if block_count == 0 {
            return BTreeSet::new();
        }
        let last_block = block_count - 1;
        let first = (visible.start / self.block_size)
            .saturating_sub(self.preload_blocks)
            .min(last_block);
        let last = (visible.end.div_ceil(self.block_size) + self.preload_blocks).min(last_block);
        (first..=last).collect()
    }

    /// Compute the schedule for a scroll position and adopt it.
    ///
    /// After this call the scroller tracks exactly the needed blocks, so an
    /// identical second call yields empty load and evict sets.
    pub fn calculate_scroll_state(
        &mut self,
        scroll_offset: f64,
        container_height: f64,
    ) -> ScrollState {
        let visible_range = self.visible_range(scroll_offset, container_height);
        let needed = self.needed_blocks(&visible_range);

        let windows_to_load: BTreeSet<usize> = needed.difference(&self.loaded).copied().collect();
        let windows_to_evict: BTreeSet<usize> = self.loaded.difference(&needed).copied().collect();
        self.loaded = needed;

        ScrollState {
            scroll_offset,
            visible_range,
            windows_to_load,
            windows_to_evict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scroller(total: usize) -> VirtualScroller {
        let mut s = VirtualScroller::new(1000, 2, 20.0);
        s.set_total_lines(total);
        s
    }

    fn set(items: &[usize]) -> BTreeSet<usize> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_visible_range_from_pixels() {
        let s = scroller(100_000);
        assert_eq!(s.visible_range(0.0, 400.0), 0..20);
        assert_eq!(s.visible_range(30.0, 400.0), 1..22);
        assert_eq!(s.visible_range(-50.0, 400.0), 0..20);
    }

    #[test]
    fn test_visible_range_clamped_to_file() {
        let s = scroller(10);
        assert_eq!(s.visible_range(0.0, 10_000.0), 0..10);
        assert_eq!(s.visible_range(100_000.0, 400.0), 10..10);
    }

    #[test]
    fn test_initial_schedule_with_preload() {
        let mut s = scroller(100_000);
        let state = s.calculate_scroll_state(0.0, 400.0);
        // visible 0..20 -> blocks [0 - 2, ceil(20/1000) + 2] = [0, 3]
        assert_eq!(state.windows_to_load, set(&[0, 1, 2, 3]));
        assert!(state.windows_to_evict.is_empty());
    }

    #[test]
    fn test_scrolling_far_evicts_previous_blocks() {
        let mut s = scroller(100_000);
        s.calculate_scroll_state(0.0, 400.0);

        // line 50_000 -> block 50
        let state = s.calculate_scroll_state(50_000.0 * 20.0, 400.0);
        assert_eq!(state.visible_range, 50_000..50_020);
        assert_eq!(state.windows_to_load, set(&[48, 49, 50, 51, 52, 53]));
        assert_eq!(state.windows_to_evict, set(&[0, 1, 2, 3]));
    }

    #[test]
    fn test_second_identical_call_is_empty() {
        let mut s = scroller(100_000);
        s.calculate_scroll_state(12_345.0, 800.0);
        let again = s.calculate_scroll_state(12_345.0, 800.0);
        assert!(again.windows_to_load.is_empty());
        assert!(again.windows_to_evict.is_empty());
    }

    #[test]
    fn test_empty_file_needs_nothing() {
        let mut s = scroller(0);
        let state = s.calculate_scroll_state(0.0, 400.0);
        assert_eq!(state.visible_range, 0..0);
        assert!(state.windows_to_load.is_empty());
    }

    #[test]
    fn test_total_lines_update_keeps_loaded() {
        let mut s = scroller(1500);
        s.calculate_scroll_state(0.0, 400.0);
        assert_eq!(s.loaded_blocks(), &set(&[0, 1]));

        s.set_total_lines(5000);
        assert_eq!(s.loaded_blocks(), &set(&[0, 1]));
        let state = s.calculate_scroll_state(0.0, 400.0);
        assert_eq!(state.windows_to_load, set(&[2, 3]));
    }

    #[test]
    fn test_mark_failed_reschedules() {
        let mut s = scroller(10_000);
        s.calculate_scroll_state(0.0, 400.0);
        s.mark_failed(1);
        let state = s.calculate_scroll_state(0.0, 400.0);
        assert_eq!(state.windows_to_load, set(&[1]));
    }

    #[test]
    fn test_block_ranges() {
        let s = scroller(2500);
        assert_eq!(s.block_count(), 3);
        assert_eq!(s.block_range(0), 0..1000);
        assert_eq!(s.block_range(2), 2000..2500);
        assert_eq!(s.blocks_for(&(999..1001)), 0..2);
        assert_eq!(s.blocks_for(&(5..5)), 0..0);
    }

    proptest! {
        #[test]
        fn prop_schedule_is_idempotent_and_in_bounds(
            total in 0usize..50_000,
            offset in 0.0f64..2_000_000.0,
            height in 0.0f64..5_000.0,
        ) {
            let mut s = scroller(total);
            let first = s.calculate_scroll_state(offset, height);
            for block in &first.windows_to_load {
                prop_assert!(*block < s.block_count());
            }
            prop_assert!(first.visible_range.end <= total);

            let second = s.calculate_scroll_state(offset, height);
            prop_assert!(second.windows_to_load.is_empty());
            prop_assert!(second.windows_to_evict.is_empty());
            prop_assert_eq!(first.visible_range, second.visible_range);
        }
    }
}
