//! Slow remote service wrapper
//!
//! This module provides a decorator around any `RemoteFileService` that adds
//! configurable delays to simulate a high-latency link, and counts calls so
//! callers can assert how many round trips an operation cost.

use super::backend::{ReadResult, RemoteFileService, RemotePath, RemoteStat};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Configuration for slow link simulation
#[derive(Debug, Clone)]
pub struct SlowRemoteConfig {
    pub stat_delay: Duration,
    pub read_delay: Duration,
    pub write_delay: Duration,
}

impl SlowRemoteConfig {
    /// Create a config with uniform delay for all operations
    pub fn uniform(delay: Duration) -> Self {
        Self {
            stat_delay: delay,
            read_delay: delay,
            write_delay: delay,
        }
    }

    /// Create a config with no delays (useful as a baseline)
    pub fn none() -> Self {
        Self::uniform(Duration::ZERO)
    }

    /// Create a config simulating an SSH session over a WAN link
    pub fn wan() -> Self {
        Self {
            stat_delay: Duration::from_millis(80),
            read_delay: Duration::from_millis(150),
            write_delay: Duration::from_millis(200),
        }
    }
}

impl Default for SlowRemoteConfig {
    fn default() -> Self {
        Self::none()
    }
}

/// Call counters for a remote service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteMetrics {
    pub stat_calls: usize,
    pub read_calls: usize,
    pub write_calls: usize,
    pub bytes_read: u64,
    /// Total time spent in artificial delays
    pub total_delay_time: Duration,
}

impl RemoteMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn total_calls(&self) -> usize {
        self.stat_calls + self.read_calls + self.write_calls
    }
}

pub struct SlowRemoteBackend {
    inner: Arc<dyn RemoteFileService>,
    config: SlowRemoteConfig,
    metrics: Arc<Mutex<RemoteMetrics>>,
}

impl SlowRemoteBackend {
    pub fn new(inner: Arc<dyn RemoteFileService>, config: SlowRemoteConfig) -> Self {
        Self {
            inner,
            config,
            metrics: Arc::new(Mutex::new(RemoteMetrics::new())),
        }
    }

    pub fn with_uniform_delay(inner: Arc<dyn RemoteFileService>, delay: Duration) -> Self {
        Self::new(inner, SlowRemoteConfig::uniform(delay))
    }

    pub async fn metrics(&self) -> RemoteMetrics {
        self.metrics.lock().await.clone()
    }

    pub async fn reset_metrics(&self) {
        self.metrics.lock().await.reset();
    }

    async fn add_delay(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
            self.metrics.lock().await.total_delay_time += delay;
        }
    }
}

#[async_trait]
impl RemoteFileService for SlowRemoteBackend {
    async fn stat(&self, path: &RemotePath) -> io::Result<RemoteStat> {
        self.add_delay(self.config.stat_delay).await;
        self.metrics.lock().await.stat_calls += 1;
        self.inner.stat(path).await
    }

    async fn read(
        &self,
        path: &RemotePath,
        start: u64,
        length: Option<u64>,
        encoding: &str,
    ) -> io::Result<ReadResult> {
        self.add_delay(self.config.read_delay).await;
        let result = self.inner.read(path, start, length, encoding).await;

        let mut metrics = self.metrics.lock().await;
        metrics.read_calls += 1;
        if let Ok(read) = &result {
            metrics.bytes_read += read.bytes_read;
        }
        drop(metrics);

        result
    }

    async fn write(&self, path: &RemotePath, content: &str, encoding: &str) -> io::Result<()> {
        self.add_delay(self.config.write_delay).await;
        self.metrics.lock().await.write_calls += 1;
        self.inner.write(path, content, encoding).await
    }
}
