// Remote file access layer
//
// The engines only depend on the `RemoteFileService` contract. Concrete
// services live next to it: the local disk, an in-memory store and a
// delay/metrics decorator used to exercise slow links.

pub mod backend;
pub mod local;
pub mod memory;
pub mod slow;

pub use backend::{ReadResult, RemoteFileService, RemotePath, RemoteStat, SessionId};
pub use local::LocalRemoteBackend;
pub use memory::MemoryRemoteBackend;
pub use slow::{RemoteMetrics, SlowRemoteBackend, SlowRemoteConfig};

use std::future::Future;
use std::io;
use std::time::Duration;

use crate::error::EngineError;
use crate::model::text_encoding::TextEncoding;

/// Turn raw bytes read from a file into a `ReadResult`.
///
/// A bounded read may stop inside a multi-byte character; the cut character
/// is left out and `bytes_read` covers only the decoded prefix, so the next
/// read resumes at that character. An unbounded read must decode completely.
/// Bytes that are not valid in `encoding` are an `InvalidData` error.
pub fn decode_read(
    bytes: &[u8],
    encoding: &str,
    bounded: bool,
    total_size: u64,
) -> io::Result<ReadResult> {
    let encoding = TextEncoding::from_label(encoding)?;
    let (content, consumed) = if bounded {
        encoding.decode_prefix(bytes)?
    } else {
        (encoding.decode_exact(bytes)?, bytes.len())
    };
    Ok(ReadResult {
        content,
        bytes_read: consumed as u64,
        total_size,
    })
}

/// Encode text for writing back to a file.
pub fn encode_write(content: &str, encoding: &str) -> io::Result<Vec<u8>> {
    Ok(TextEncoding::from_label(encoding)?.encode(content)?)
}

/// Run a remote call with a bounded wait, classifying failures.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    path: &RemotePath,
    limit: Duration,
    call: F,
) -> Result<T, EngineError>
where
    F: Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(EngineError::from_io(operation, path, &e)),
        Err(_) => Err(EngineError::Timeout {
            operation,
            target: path.to_string(),
            after: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let path = RemotePath::local("/slow");
        let result: Result<(), _> = with_deadline("stat", &path, Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert_eq!(
            result,
            Err(EngineError::Timeout {
                operation: "stat",
                target: "session-0:/slow".to_string(),
                after: Duration::from_millis(50),
            })
        );
    }

    #[tokio::test]
    async fn test_deadline_maps_io_error() {
        let path = RemotePath::local("/missing");
        let result: Result<(), _> = with_deadline("read", &path, Duration::from_secs(1), async {
            Err(io::Error::new(io::ErrorKind::NotFound, "missing"))
        })
        .await;

        assert!(matches!(result, Err(EngineError::NotFound { operation: "read", .. })));
    }

    #[test]
    fn test_bounded_read_stops_before_cut_character() {
        let read = decode_read(b"ok caf\xC3", "utf-8", true, 12).unwrap();
        assert_eq!(read.content, "ok caf");
        assert_eq!(read.bytes_read, 6);
        assert_eq!(read.total_size, 12);

        let err = decode_read(b"ok caf\xC3", "utf-8", false, 7).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_read_rejects_invalid_bytes_and_unknown_encodings() {
        let err = decode_read(b"caf\xE9\n", "utf-8", true, 5).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = decode_read(b"abc", "ebcdic", false, 3).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);

        assert_eq!(encode_write("café", "latin1").unwrap(), b"caf\xE9");
        assert!(encode_write("€", "latin1").is_err());
    }
}
