//! Time source abstraction for testability.
//!
//! Cache recency scores and the watcher's "time since last change" logic read
//! time through `TimeSource`, so tests can advance a logical clock instead of
//! sleeping. Timer scheduling itself goes through tokio.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Abstraction over time-related operations.
pub trait TimeSource: Send + Sync + std::fmt::Debug {
    /// Get the current instant for measuring elapsed time.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for timestamps reported to users.
    fn wall_clock(&self) -> DateTime<Utc>;

    /// Calculate elapsed time since an earlier instant.
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Type alias for shared time source.
pub type SharedTimeSource = Arc<dyn TimeSource>;

/// Production implementation using actual system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealTimeSource;

impl RealTimeSource {
    pub fn new() -> Self {
        Self
    }

    pub fn shared() -> SharedTimeSource {
        Arc::new(Self)
    }
}

impl TimeSource for RealTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test implementation with controllable time.
///
/// - `now()` returns a logical instant based on an internal counter
/// - Time only moves when `advance()` is called
///
/// # Example
///
/// ```
/// use remote_window::services::time_source::{TimeSource, TestTimeSource};
/// use std::time::Duration;
///
/// let time = TestTimeSource::new();
/// let start = time.now();
/// time.advance(Duration::from_secs(5));
///
/// assert_eq!(time.elapsed_since(start), Duration::from_secs(5));
/// ```
#[derive(Debug)]
pub struct TestTimeSource {
    /// Logical time in nanoseconds since creation.
    logical_nanos: AtomicU64,
    /// Base instant (real time at creation, used for Instant arithmetic).
    base_instant: Instant,
    base_wall: DateTime<Utc>,
}

impl Default for TestTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTimeSource {
    pub fn new() -> Self {
        Self {
            logical_nanos: AtomicU64::new(0),
            base_instant: Instant::now(),
            base_wall: Utc::now(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advance logical time by the given duration.
    pub fn advance(&self, duration: Duration) {
        self.logical_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Get the logical elapsed time since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.logical_nanos.load(Ordering::SeqCst))
    }
}

impl TimeSource for TestTimeSource {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn wall_clock(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed()).unwrap_or(chrono::Duration::zero());
        self.base_wall + elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_time_source_now_advances() {
        let ts = RealTimeSource::new();
        let t1 = ts.now();
        std::thread::sleep(Duration::from_millis(1));
        assert!(ts.now() > t1);
    }

    #[test]
    fn test_time_source_only_moves_on_advance() {
        let ts = TestTimeSource::new();
        let start = ts.now();
        assert_eq!(ts.elapsed_since(start), Duration::ZERO);

        ts.advance(Duration::from_secs(5));
        assert_eq!(ts.elapsed(), Duration::from_secs(5));
        assert_eq!(ts.elapsed_since(start), Duration::from_secs(5));
    }

    #[test]
    fn test_wall_clock_follows_logical_time() {
        let ts = TestTimeSource::new();
        let before = ts.wall_clock();
        ts.advance(Duration::from_secs(90));
        assert_eq!((ts.wall_clock() - before).num_seconds(), 90);
    }

    #[test]
    fn test_time_source_thread_safe() {
        let ts = Arc::new(TestTimeSource::new());
        let ts_clone = ts.clone();

        let handle = std::thread::spawn(move || {
            for _ in 0..100 {
                ts_clone.advance(Duration::from_millis(1));
            }
        });
        for _ in 0..100 {
            ts.advance(Duration::from_millis(1));
        }
        handle.join().unwrap();

        assert_eq!(ts.elapsed(), Duration::from_millis(200));
    }
}
