//! `RemoteFileService` over the local filesystem.
//!
//! Sessions are ignored; every path is resolved on this machine. Useful for
//! the command-line tool and as the reference implementation in tests.

use super::backend::{ReadResult, RemoteFileService, RemotePath, RemoteStat};
use async_trait::async_trait;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRemoteBackend;

impl LocalRemoteBackend {
    pub fn new() -> Self {
        Self
    }

    /// Temporary sibling path used for atomic writes
    fn temp_path_for(path: &Path) -> PathBuf {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "remote-window".to_string());
        path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()))
    }
}

#[async_trait]
impl RemoteFileService for LocalRemoteBackend {
    async fn stat(&self, path: &RemotePath) -> io::Result<RemoteStat> {
        let meta = tokio::fs::metadata(&path.path).await?;
        Ok(RemoteStat {
            size: meta.len(),
            modified: meta.modified().ok(),
            is_directory: meta.is_dir(),
        })
    }

    async fn read(
        &self,
        path: &RemotePath,
        start: u64,
        length: Option<u64>,
        encoding: &str,
    ) -> io::Result<ReadResult> {
        let mut file = tokio::fs::File::open(&path.path).await?;
        let total_size = file.metadata().await?.len();

        let mut buf = Vec::new();
        if start < total_size {
            file.seek(SeekFrom::Start(start)).await?;
            let available = total_size - start;
            let wanted = length.map_or(available, |len| len.min(available));
            file.take(wanted).read_to_end(&mut buf).await?;
        }

        super::decode_read(&buf, encoding, length.is_some(), total_size).inspect_err(|e| {
            tracing::debug!("Could not decode {} as {}: {}", path.path, encoding, e);
        })
    }

    async fn write(&self, path: &RemotePath, content: &str, encoding: &str) -> io::Result<()> {
        let bytes = super::encode_write(content, encoding)?;
        let dest = Path::new(&path.path);
        let temp = Self::temp_path_for(dest);

        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = tokio::fs::rename(&temp, dest).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }
        Ok(())
    }
}
