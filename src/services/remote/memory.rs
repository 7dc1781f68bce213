//! In-memory `RemoteFileService`.
//!
//! Files live in a map keyed by path; every mutation bumps a logical
//! modification time so watchers observe changes deterministically. Failure
//! injection hooks let callers simulate a flaky link.

use super::backend::{ReadResult, RemoteFileService, RemotePath, RemoteStat};
use super::slow::RemoteMetrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone)]
struct MemoryFile {
    content: Vec<u8>,
    version: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: HashMap<String, MemoryFile>,
    clock: u64,
    failing_stats: usize,
    fail_reads: bool,
    fail_writes: bool,
    read_limit: Option<u64>,
    metrics: RemoteMetrics,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRemoteBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemoteBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(state: &mut MemoryState) -> u64 {
        state.clock += 1;
        state.clock
    }

    /// Create or replace a file
    pub fn insert(&self, path: &str, content: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        let version = Self::bump(&mut state);
        state.files.insert(
            path.to_string(),
            MemoryFile {
                content: content.into(),
                version,
            },
        );
    }

    /// Append bytes to a file, creating it if needed
    pub fn append(&self, path: &str, bytes: impl AsRef<[u8]>) {
        let mut state = self.lock();
        let version = Self::bump(&mut state);
        let file = state
            .files
            .entry(path.to_string())
            .or_insert_with(|| MemoryFile {
                content: Vec::new(),
                version,
            });
        file.content.extend_from_slice(bytes.as_ref());
        file.version = version;
    }

    /// Truncate a file to `len` bytes
    pub fn truncate(&self, path: &str, len: usize) {
        let mut state = self.lock();
        let version = Self::bump(&mut state);
        if let Some(file) = state.files.get_mut(path) {
            file.content.truncate(len);
            file.version = version;
        }
    }

    /// Update the modification time without touching content
    pub fn touch(&self, path: &str) {
        let mut state = self.lock();
        let version = Self::bump(&mut state);
        if let Some(file) = state.files.get_mut(path) {
            file.version = version;
        }
    }

    pub fn remove(&self, path: &str) {
        self.lock().files.remove(path);
    }

    /// Raw content of a file
    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).map(|f| f.content.clone())
    }

    /// Make the next `count` stat calls fail with a transport error
    pub fn fail_next_stats(&self, count: usize) {
        self.lock().failing_stats = count;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    /// Cap the number of bytes a single read returns, like a link that
    /// delivers large ranges in pieces
    pub fn set_read_limit(&self, limit: Option<u64>) {
        self.lock().read_limit = limit;
    }

    pub fn metrics(&self) -> RemoteMetrics {
        self.lock().metrics.clone()
    }

    pub fn reset_metrics(&self) {
        self.lock().metrics.reset();
    }
}

fn modified_at(version: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(version)
}

fn not_found(path: &RemotePath) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} does not exist", path.path))
}

#[async_trait]
impl RemoteFileService for MemoryRemoteBackend {
    async fn stat(&self, path: &RemotePath) -> io::Result<RemoteStat> {
        let mut state = self.lock();
        state.metrics.stat_calls += 1;
        if state.failing_stats > 0 {
            state.failing_stats -= 1;
            return Err(io::Error::other("simulated stat failure"));
        }
        let file = state.files.get(&path.path).ok_or_else(|| not_found(path))?;
        Ok(RemoteStat::file(file.content.len() as u64).with_modified(modified_at(file.version)))
    }

    async fn read(
        &self,
        path: &RemotePath,
        start: u64,
        length: Option<u64>,
        encoding: &str,
    ) -> io::Result<ReadResult> {
        let mut state = self.lock();
        state.metrics.read_calls += 1;
        if state.fail_reads {
            return Err(io::Error::other("simulated read failure"));
        }
        let file = state.files.get(&path.path).ok_or_else(|| not_found(path))?;
        let total = file.content.len();
        let from = (start as usize).min(total);
        let length = match (length, state.read_limit) {
            (Some(len), Some(limit)) => Some(len.min(limit)),
            (len, limit) => len.or(limit),
        };
        let to = match length {
            Some(len) => from.saturating_add(len as usize).min(total),
            None => total,
        };
        let result = super::decode_read(
            &file.content[from..to],
            encoding,
            length.is_some(),
            total as u64,
        )?;
        state.metrics.bytes_read += result.bytes_read;
        Ok(result)
    }

    async fn write(&self, path: &RemotePath, content: &str, encoding: &str) -> io::Result<()> {
        let bytes = super::encode_write(content, encoding)?;
        let mut state = self.lock();
        state.metrics.write_calls += 1;
        if state.fail_writes {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "simulated write failure",
            ));
        }
        let version = Self::bump(&mut state);
        state.files.insert(
            path.path.clone(),
            MemoryFile {
                content: bytes,
                version,
            },
        );
        Ok(())
    }
}
