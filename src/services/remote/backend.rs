use async_trait::async_trait;
use std::fmt;
use std::io;
use std::time::SystemTime;

/// Identifies the connection a remote path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub usize);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A path on a specific remote session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemotePath {
    pub session: SessionId,
    pub path: String,
}

impl RemotePath {
    pub fn new(session: SessionId, path: impl Into<String>) -> Self {
        Self {
            session,
            path: path.into(),
        }
    }

    /// A path on the default (local) session
    pub fn local(path: impl Into<String>) -> Self {
        Self::new(SessionId(0), path)
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.path)
    }
}

/// Result of a remote stat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_directory: bool,
}

impl RemoteStat {
    pub fn file(size: u64) -> Self {
        Self {
            size,
            modified: None,
            is_directory: false,
        }
    }

    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.modified = Some(modified);
        self
    }
}

/// Result of a remote byte-range read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    /// Decoded content of the range
    pub content: String,
    /// Number of raw bytes read from the file
    pub bytes_read: u64,
    /// Size of the whole file at the time of the read
    pub total_size: u64,
}

/// Async remote file service
///
/// This trait abstracts the byte-range transfer service the engines sit on
/// top of. Implementations may talk to a remote agent, a network filesystem,
/// the local disk or an in-memory store. Concurrency control on the remote
/// side is the implementation's concern; callers impose no locking.
#[async_trait]
pub trait RemoteFileService: Send + Sync {
    /// Get size, modification time and kind of a path
    ///
    /// # Errors
    ///
    /// Returns `NotFound`/`PermissionDenied` kinds when the path cannot be
    /// stat'ed; any other kind is treated as a transport failure.
    async fn stat(&self, path: &RemotePath) -> io::Result<RemoteStat>;

    /// Read `length` bytes starting at byte `start`
    ///
    /// `length = None` reads to the end of the file. Reads past the end return
    /// whatever is available (possibly nothing). A bounded read may return
    /// fewer bytes than asked for, e.g. stopping before a multi-byte character
    /// cut at the end of the range; `bytes_read` says where to resume.
    ///
    /// # Errors
    ///
    /// `InvalidData` when the bytes are not valid in `encoding`, and
    /// `Unsupported` when the encoding is unknown. Content is never decoded
    /// lossily, so what is read can be written back unchanged.
    async fn read(
        &self,
        path: &RemotePath,
        start: u64,
        length: Option<u64>,
        encoding: &str,
    ) -> io::Result<ReadResult>;

    /// Replace the whole file content, encoded as `encoding`
    async fn write(&self, path: &RemotePath, content: &str, encoding: &str) -> io::Result<()>;
}
