//! Full-load ("edit") access to one remote file.
//!
//! The whole file is read into memory, edited there, and written back in one
//! piece. Dirty tracking compares the buffer against the last loaded or saved
//! content exactly.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{EngineError, EngineResult};
use crate::event::{EngineEvent, EventBus, EventSource, Subscription};
use crate::services::file_watcher::WatchUpdate;
use crate::services::remote::{with_deadline, RemoteFileService, RemotePath};

#[derive(Debug, Clone, PartialEq)]
pub struct EditOptions {
    pub max_full_load_bytes: u64,
    pub remote_timeout: Duration,
    pub encoding: String,
}

impl Default for EditOptions {
    fn default() -> Self {
        Self {
            max_full_load_bytes: 100 * 1024 * 1024,
            remote_timeout: Duration::from_secs(15),
            encoding: "utf-8".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct EditBuffer {
    /// `None` until loaded
    content: Option<String>,
    /// Content as last loaded or saved
    saved: String,
    /// Bumped on every edit, so a save can tell whether it captured the latest text
    revision: u64,
    saved_revision: u64,
    external_change_pending: bool,
}

impl EditBuffer {
    fn is_dirty(&self) -> bool {
        self.content.as_deref().is_some_and(|c| c != self.saved)
    }
}

struct EditInner {
    path: RemotePath,
    remote: Arc<dyn RemoteFileService>,
    options: Mutex<EditOptions>,
    buffer: Mutex<EditBuffer>,
    /// Serializes loads and saves against each other
    io_lock: tokio::sync::Mutex<()>,
    autosave: Mutex<Option<JoinHandle<()>>>,
    bus: Arc<EventBus>,
}

impl Drop for EditInner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.autosave).take() {
            task.abort();
        }
    }
}

/// Full-content editor for one remote file; cheap to clone
#[derive(Clone)]
pub struct EditEngine {
    inner: Arc<EditInner>,
}

impl std::fmt::Debug for EditEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditEngine")
            .field("path", &self.inner.path)
            .field("loaded", &self.is_loaded())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EditEngine {
    pub fn new(path: RemotePath, remote: Arc<dyn RemoteFileService>, options: EditOptions) -> Self {
        Self {
            inner: Arc::new(EditInner {
                path,
                remote,
                options: Mutex::new(options),
                buffer: Mutex::new(EditBuffer::default()),
                io_lock: tokio::sync::Mutex::new(()),
                autosave: Mutex::new(None),
                bus: EventBus::shared(EventSource::Edit),
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

    fn buffer(&self) -> MutexGuard<'_, EditBuffer> {
        lock(&self.inner.buffer)
    }

    fn options(&self) -> EditOptions {
        lock(&self.inner.options).clone()
    }

    pub fn set_encoding(&self, encoding: &str) {
        lock(&self.inner.options).encoding = encoding.to_string();
    }

    /// Read the whole file into the buffer, replacing any previous content.
    ///
    /// Fails with `FileTooLarge` above the full-load ceiling, and rejects a
    /// read that returned a different number of bytes than the file holds.
    pub async fn load(&self) -> EngineResult<usize> {
        let _io = self.inner.io_lock.lock().await;
        let options = self.options();
        let path = &self.inner.path;

        let stat = with_deadline(
            "stat",
            path,
            options.remote_timeout,
            self.inner.remote.stat(path),
        )
        .await?;
        if stat.is_directory {
            return Err(EngineError::unknown("load", path, "is a directory"));
        }
        if stat.size > options.max_full_load_bytes {
            return Err(EngineError::FileTooLarge {
                path: path.to_string(),
                size: stat.size,
                limit: options.max_full_load_bytes,
            });
        }

        let read = with_deadline(
            "read",
            path,
            options.remote_timeout,
            self.inner.remote.read(path, 0, None, &options.encoding),
        )
        .await?;
        if read.bytes_read != read.total_size {
            return Err(EngineError::unknown(
                "load",
                path,
                format!(
                    "read {} of {} bytes; file changed during load",
                    read.bytes_read, read.total_size
                ),
            ));
        }
        if read.total_size > options.max_full_load_bytes {
            return Err(EngineError::FileTooLarge {
                path: path.to_string(),
                size: read.total_size,
                limit: options.max_full_load_bytes,
            });
        }

        let bytes = read.content.len();
        let was_dirty = {
            let mut buffer = self.buffer();
            let was_dirty = buffer.is_dirty();
            buffer.saved = read.content.clone();
            buffer.content = Some(read.content);
            buffer.revision += 1;
            buffer.saved_revision = buffer.revision;
            buffer.external_change_pending = false;
            was_dirty
        };

        tracing::info!("Loaded {} ({} bytes)", path, bytes);
        self.emit(EngineEvent::ContentLoaded { bytes });
        if was_dirty {
            self.emit(EngineEvent::DirtyChanged { dirty: false });
        }
        Ok(bytes)
    }

    pub fn is_loaded(&self) -> bool {
        self.buffer().content.is_some()
    }

    /// Copy of the current content, if loaded
    pub fn content(&self) -> Option<String> {
        self.buffer().content.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.buffer().is_dirty()
    }

    /// Whether the file changed remotely while the buffer was dirty
    pub fn has_external_change(&self) -> bool {
        self.buffer().external_change_pending
    }

    /// Replace the whole content.
    pub fn set_content(&self, content: impl Into<String>) -> EngineResult<()> {
        let content = content.into();
        self.update(move |text| *text = content)
    }

    /// Edit the content in place.
    pub fn update(&self, edit: impl FnOnce(&mut String)) -> EngineResult<()> {
        let (before, after) = {
            let mut buffer = self.buffer();
            let before = buffer.is_dirty();
            let Some(content) = buffer.content.as_mut() else {
                return Err(EngineError::unknown(
                    "edit",
                    &self.inner.path,
                    "content is not loaded",
                ));
            };
            edit(content);
            buffer.revision += 1;
            (before, buffer.is_dirty())
        };
        if before != after {
            self.emit(EngineEvent::DirtyChanged { dirty: after });
        }
        Ok(())
    }

    /// Write the current content back. A clean buffer is not written.
    ///
    /// Returns the number of bytes written. Edits made while the write is in
    /// flight keep the buffer dirty.
    pub async fn save(&self) -> EngineResult<usize> {
        let _io = self.inner.io_lock.lock().await;
        let (snapshot, revision) = {
            let buffer = self.buffer();
            let Some(content) = buffer.content.as_ref() else {
                return Err(EngineError::unknown(
                    "save",
                    &self.inner.path,
                    "content is not loaded",
                ));
            };
            if !buffer.is_dirty() {
                return Ok(0);
            }
            (content.clone(), buffer.revision)
        };

        let options = self.options();
        let path = &self.inner.path;
        with_deadline(
            "write",
            path,
            options.remote_timeout,
            self.inner.remote.write(path, &snapshot, &options.encoding),
        )
        .await?;

        let bytes = snapshot.len();
        let still_dirty = {
            let mut buffer = self.buffer();
            buffer.saved = snapshot;
            buffer.saved_revision = revision;
            buffer.external_change_pending = false;
            buffer.is_dirty()
        };

        tracing::info!("Saved {} ({} bytes)", path, bytes);
        self.emit(EngineEvent::Saved { bytes });
        if !still_dirty {
            self.emit(EngineEvent::DirtyChanged { dirty: false });
        }
        Ok(bytes)
    }

    /// Throw away unsaved edits, returning to the last loaded/saved content.
    pub fn discard(&self) {
        let was_dirty = {
            let mut buffer = self.buffer();
            let was_dirty = buffer.is_dirty();
            if buffer.content.is_some() {
                buffer.content = Some(buffer.saved.clone());
                buffer.revision += 1;
            }
            was_dirty
        };
        if was_dirty {
            self.emit(EngineEvent::DirtyChanged { dirty: false });
        }
    }

    /// Drop the loaded content entirely.
    pub fn unload(&self) {
        self.stop_autosave();
        *self.buffer() = EditBuffer::default();
    }

    /// React to the file changing remotely.
    ///
    /// A clean buffer is reloaded; a dirty one keeps the local edits and
    /// raises `ExternalChangeConflict`. Returns false for other paths.
    pub async fn apply_watch_update(&self, update: &WatchUpdate) -> EngineResult<bool> {
        if update.path != self.inner.path || !self.is_loaded() {
            return Ok(false);
        }
        if self.is_dirty() {
            let newly_flagged = {
                let mut buffer = self.buffer();
                !std::mem::replace(&mut buffer.external_change_pending, true)
            };
            if newly_flagged {
                tracing::warn!("{} changed remotely with unsaved edits", self.inner.path);
                self.emit(EngineEvent::ExternalChangeConflict);
            }
            return Ok(true);
        }
        self.load().await?;
        Ok(true)
    }

    /// Save dirty content every `interval` until stopped or unloaded.
    pub fn start_autosave(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let engine = EditEngine { inner };
                if engine.is_dirty() {
                    if let Err(e) = engine.save().await {
                        tracing::warn!("Autosave of {} failed: {}", engine.inner.path, e);
                    }
                }
            }
        });
        if let Some(previous) = lock(&self.inner.autosave).replace(task) {
            previous.abort();
        }
    }

    pub fn stop_autosave(&self) -> bool {
        match lock(&self.inner.autosave).take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::file_watcher::WatchUpdateKind;
    use crate::services::remote::{MemoryRemoteBackend, ReadResult, RemoteStat};

    const PATH: &str = "/etc/app.conf";

    fn setup(content: &str) -> (MemoryRemoteBackend, EditEngine) {
        let backend = MemoryRemoteBackend::new();
        backend.insert(PATH, content);
        let engine = EditEngine::new(
            RemotePath::local(PATH),
            Arc::new(backend.clone()),
            EditOptions::default(),
        );
        (backend, engine)
    }

    fn reload_update() -> WatchUpdate {
        WatchUpdate {
            path: RemotePath::local(PATH),
            kind: WatchUpdateKind::FullReload {
                reason: "modified".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_load_edit_save() {
        let (backend, engine) = setup("port = 80\n");
        let mut events = engine.subscribe();

        assert_eq!(engine.load().await.unwrap(), 10);
        assert!(!engine.is_dirty());

        engine
            .update(|text| *text = text.replace("80", "8080"))
            .unwrap();
        assert!(engine.is_dirty());

        assert_eq!(engine.save().await.unwrap(), 12);
        assert!(!engine.is_dirty());
        assert_eq!(backend.content(PATH).unwrap(), b"port = 8080\n");

        assert_eq!(
            events.drain(),
            vec![
                EngineEvent::ContentLoaded { bytes: 10 },
                EngineEvent::DirtyChanged { dirty: true },
                EngineEvent::Saved { bytes: 12 },
                EngineEvent::DirtyChanged { dirty: false },
            ]
        );
    }

    #[tokio::test]
    async fn test_reverting_an_edit_is_clean() {
        let (_backend, engine) = setup("abc");
        engine.load().await.unwrap();
        engine.set_content("abcd").unwrap();
        assert!(engine.is_dirty());
        engine.update(|t| {
            t.pop();
        })
        .unwrap();
        assert!(!engine.is_dirty());
    }

    #[tokio::test]
    async fn test_one_byte_difference_is_dirty() {
        let (_backend, engine) = setup("abc\n");
        engine.load().await.unwrap();
        engine.set_content("abc").unwrap();
        assert!(engine.is_dirty());
    }

    #[tokio::test]
    async fn test_too_large_file_is_rejected() {
        let backend = MemoryRemoteBackend::new();
        backend.insert(PATH, vec![b'x'; 2048]);
        let engine = EditEngine::new(
            RemotePath::local(PATH),
            Arc::new(backend),
            EditOptions {
                max_full_load_bytes: 1024,
                ..EditOptions::default()
            },
        );
        let err = engine.load().await.unwrap_err();
        assert!(matches!(err, EngineError::FileTooLarge { size: 2048, limit: 1024, .. }));
        assert!(!engine.is_loaded());
    }

    /// Reports ten bytes but hands back only nine of them
    #[derive(Debug)]
    struct TruncatingRemote;

    #[async_trait::async_trait]
    impl RemoteFileService for TruncatingRemote {
        async fn stat(&self, _path: &RemotePath) -> std::io::Result<RemoteStat> {
            Ok(RemoteStat::file(10))
        }

        async fn read(
            &self,
            _path: &RemotePath,
            _start: u64,
            _length: Option<u64>,
            _encoding: &str,
        ) -> std::io::Result<ReadResult> {
            Ok(ReadResult {
                content: "123456789".to_string(),
                bytes_read: 9,
                total_size: 10,
            })
        }

        async fn write(&self, _path: &RemotePath, _content: &str, _encoding: &str) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_short_read_is_not_loaded() {
        let engine = EditEngine::new(
            RemotePath::local(PATH),
            Arc::new(TruncatingRemote),
            EditOptions::default(),
        );
        let mut events = engine.subscribe();

        let err = engine.load().await.unwrap_err();
        assert!(matches!(err, EngineError::Unknown { operation: "load", .. }));
        assert!(!engine.is_loaded());
        assert_eq!(engine.content(), None);
        assert!(events.drain().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_file_is_not_loaded() {
        let backend = MemoryRemoteBackend::new();
        backend.insert(PATH, b"name = caf\xe9\nport = 80\n".to_vec());
        let engine = EditEngine::new(
            RemotePath::local(PATH),
            Arc::new(backend.clone()),
            EditOptions::default(),
        );

        assert!(engine.load().await.is_err());
        assert!(!engine.is_loaded());
        assert_eq!(backend.content(PATH).unwrap(), b"name = caf\xe9\nport = 80\n");
    }

    #[tokio::test]
    async fn test_latin1_round_trip_keeps_bytes() {
        let backend = MemoryRemoteBackend::new();
        backend.insert(PATH, b"name = caf\xe9\nport = 80\n".to_vec());
        let engine = EditEngine::new(
            RemotePath::local(PATH),
            Arc::new(backend.clone()),
            EditOptions {
                encoding: "iso-8859-1".to_string(),
                ..EditOptions::default()
            },
        );

        engine.load().await.unwrap();
        assert_eq!(engine.content().as_deref(), Some("name = café\nport = 80\n"));
        engine
            .update(|text| *text = text.replace("80", "8080"))
            .unwrap();
        engine.save().await.unwrap();
        assert_eq!(backend.content(PATH).unwrap(), b"name = caf\xe9\nport = 8080\n");
    }

    #[tokio::test]
    async fn test_failed_save_keeps_dirty_content() {
        let (backend, engine) = setup("a");
        engine.load().await.unwrap();
        engine.set_content("b").unwrap();

        backend.set_fail_writes(true);
        assert!(engine.save().await.is_err());
        assert!(engine.is_dirty());
        assert_eq!(engine.content().as_deref(), Some("b"));
        assert_eq!(backend.content(PATH).unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_edit_requires_load() {
        let (_backend, engine) = setup("a");
        assert!(engine.set_content("x").is_err());
        assert!(engine.save().await.is_err());
    }

    #[tokio::test]
    async fn test_discard_restores_saved() {
        let (_backend, engine) = setup("keep");
        engine.load().await.unwrap();
        engine.set_content("drop").unwrap();
        engine.discard();
        assert_eq!(engine.content().as_deref(), Some("keep"));
        assert!(!engine.is_dirty());
    }

    #[tokio::test]
    async fn test_external_change_reloads_clean_buffer() {
        let (backend, engine) = setup("v1");
        engine.load().await.unwrap();
        backend.insert(PATH, "v2");

        assert!(engine.apply_watch_update(&reload_update()).await.unwrap());
        assert_eq!(engine.content().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_external_change_on_dirty_buffer_conflicts() {
        let (backend, engine) = setup("v1");
        engine.load().await.unwrap();
        engine.set_content("local").unwrap();
        let mut events = engine.subscribe();
        backend.insert(PATH, "remote");

        engine.apply_watch_update(&reload_update()).await.unwrap();
        engine.apply_watch_update(&reload_update()).await.unwrap();

        assert_eq!(engine.content().as_deref(), Some("local"));
        assert!(engine.has_external_change());
        assert_eq!(events.drain(), vec![EngineEvent::ExternalChangeConflict]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_writes_dirty_content() {
        let (backend, engine) = setup("a");
        engine.load().await.unwrap();
        engine.start_autosave(Duration::from_secs(5));
        engine.set_content("autosaved").unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(backend.content(PATH).unwrap(), b"autosaved");
        assert!(engine.stop_autosave());
    }
}
