//! Line tool over a `MemoryRemoteBackend`.
//!
//! Answers the same queries as the process-backed tool, directly from the
//! in-memory file contents. Every invocation is counted so callers can assert
//! how many underlying fetches an operation caused.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{decode_line, output_encoding};
use super::{ExternalLineTool, LineQuery, LineRequest, LineStream, ToolOutput};
use crate::error::{EngineError, EngineResult};
use crate::model::text_encoding::TextEncoding;
use crate::services::remote::{MemoryRemoteBackend, RemotePath};

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Number of invocations per query kind
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationCounts {
    pub ranges: usize,
    pub counts: usize,
    pub matches: usize,
    pub follows: usize,
}

impl InvocationCounts {
    pub fn total(&self) -> usize {
        self.ranges + self.counts + self.matches + self.follows
    }
}

#[derive(Debug, Default)]
struct ToolState {
    counts: InvocationCounts,
    delay: Option<Duration>,
    fail_with: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct MemoryLineTool {
    backend: MemoryRemoteBackend,
    state: Arc<Mutex<ToolState>>,
}

impl MemoryLineTool {
    pub fn new(backend: MemoryRemoteBackend) -> Self {
        Self {
            backend,
            state: Arc::new(Mutex::new(ToolState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ToolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn invocations(&self) -> InvocationCounts {
        self.lock().counts.clone()
    }

    pub fn reset_invocations(&self) {
        self.lock().counts = InvocationCounts::default();
    }

    /// Hold every bounded invocation for `delay` before answering
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Make bounded invocations fail as if the process exited with `code`
    pub fn set_fail(&self, code: Option<i32>) {
        self.lock().fail_with = code;
    }

    fn text(&self, path: &RemotePath, encoding: TextEncoding) -> Option<String> {
        self.backend
            .content(&path.path)
            .map(|bytes| encoding.decode_lossy(&bytes))
    }
}

fn describe(request: &LineRequest) -> String {
    match &request.query {
        LineQuery::Range { start, end } => format!("lines {}..{} of {}", start, end, request.path),
        LineQuery::CountLines => format!("count {}", request.path),
        LineQuery::Match(p) => format!("match {:?} in {}", p.pattern, request.path),
    }
}

#[async_trait]
impl ExternalLineTool for MemoryLineTool {
    async fn run(&self, request: &LineRequest) -> EngineResult<ToolOutput> {
        let command = describe(request);
        let encoding = request.text_encoding()?;
        let (delay, fail_with) = {
            let mut state = self.lock();
            match request.query {
                LineQuery::Range { .. } => state.counts.ranges += 1,
                LineQuery::CountLines => state.counts.counts += 1,
                LineQuery::Match(_) => state.counts.matches += 1,
            }
            (state.delay, state.fail_with)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(code) = fail_with {
            return Err(EngineError::Command {
                command,
                exit_code: Some(code),
                stderr: "injected failure".to_string(),
            });
        }

        let text = self.text(&request.path, encoding).ok_or_else(|| EngineError::Command {
            command: command.clone(),
            exit_code: Some(2),
            stderr: format!("{}: No such file or directory", request.path.path),
        })?;

        let stdout = match &request.query {
            LineQuery::Range { start, end } => text
                .lines()
                .skip(*start)
                .take(end.saturating_sub(*start))
                .map(|l| format!("{l}\n"))
                .collect(),
            LineQuery::CountLines => format!("{}\n", text.lines().count()),
            LineQuery::Match(spec) => {
                let compiled = spec.compile()?;
                text.lines()
                    .enumerate()
                    .filter(|(_, l)| compiled.is_match(l))
                    .map(|(i, l)| format!("{}:{}\n", i + 1, l))
                    .collect()
            }
        };

        Ok(ToolOutput { command, stdout })
    }

    async fn follow(&self, path: &RemotePath, encoding: &str) -> EngineResult<LineStream> {
        let encoding = output_encoding(encoding, "follow", path)?;
        self.lock().counts.follows += 1;
        let initial = self.backend.content(&path.path).ok_or_else(|| {
            EngineError::NotFound {
                operation: "follow",
                path: path.to_string(),
            }
        })?;

        let backend = self.backend.clone();
        let key = path.path.clone();
        let (tx, rx) = mpsc::channel(1024);
        let producer = tokio::spawn(async move {
            let mut position = initial.len();
            loop {
                tokio::time::sleep(FOLLOW_POLL_INTERVAL).await;
                let Some(content) = backend.content(&key) else {
                    continue;
                };
                if content.len() < position {
                    // truncated: follow from the new end, like `tail -F`
                    position = content.len();
                    continue;
                }
                // Only complete lines; a partial line waits for its newline
                let Some(last_newline) = content[position..].iter().rposition(|&b| b == b'\n') else {
                    continue;
                };
                let end = position + last_newline + 1;
                for raw in content[position..end].split_inclusive(|&b| b == b'\n') {
                    if tx.send(decode_line(raw, encoding)).await.is_err() {
                        return;
                    }
                }
                position = end;
            }
        });

        Ok(LineStream::new(rx, producer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::pattern::PatternSpec;

    fn setup(content: &str) -> (MemoryRemoteBackend, MemoryLineTool, RemotePath) {
        let backend = MemoryRemoteBackend::new();
        backend.insert("/log", content);
        let tool = MemoryLineTool::new(backend.clone());
        (backend, tool, RemotePath::local("/log"))
    }

    #[tokio::test]
    async fn test_range_and_count() {
        let (_b, tool, path) = setup("a\nb\nc\nd\n");

        let out = tool
            .run(&LineRequest::new(path.clone(), LineQuery::Range { start: 1, end: 3 }))
            .await
            .unwrap();
        assert_eq!(out.lines(), vec!["b", "c"]);

        let count = tool
            .run(&LineRequest::new(path, LineQuery::CountLines))
            .await
            .unwrap();
        assert_eq!(count.line_count().unwrap(), 4);
        assert_eq!(
            tool.invocations(),
            InvocationCounts {
                ranges: 1,
                counts: 1,
                ..Default::default()
            }
        );
    }

    #[tokio::test]
    async fn test_match_output_is_numbered() {
        let (_b, tool, path) = setup("ok\nERROR one\nok\nerror two\n");
        let out = tool
            .run(&LineRequest::new(
                path,
                LineQuery::Match(PatternSpec::literal("error").case_sensitive(false)),
            ))
            .await
            .unwrap();
        assert_eq!(out.lines(), vec!["2:ERROR one", "4:error two"]);
    }

    #[tokio::test]
    async fn test_injected_failure_carries_exit_code() {
        let (_b, tool, path) = setup("x\n");
        tool.set_fail(Some(127));
        let err = tool
            .run(&LineRequest::new(path, LineQuery::CountLines))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Command { exit_code: Some(127), .. }));
    }

    #[tokio::test]
    async fn test_output_follows_request_encoding() {
        let backend = MemoryRemoteBackend::new();
        backend.insert("/legacy", b"caf\xe9\n".to_vec());
        let tool = MemoryLineTool::new(backend);
        let path = RemotePath::local("/legacy");

        let out = tool
            .run(
                &LineRequest::new(path.clone(), LineQuery::Range { start: 0, end: 1 })
                    .with_encoding("latin1"),
            )
            .await
            .unwrap();
        assert_eq!(out.lines(), vec!["café"]);

        assert!(tool.follow(&path, "ebcdic").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_holds_back_split_characters() {
        let (backend, tool, path) = setup("");
        let mut stream = tool.follow(&path, "utf-8").await.unwrap();

        backend.append("/log", b"caf\xc3");
        tokio::time::sleep(Duration::from_millis(200)).await;
        backend.append("/log", b"\xa9\n");
        assert_eq!(stream.recv().await.as_deref(), Some("café"));
        stream.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_emits_only_appended_lines() {
        let (backend, tool, path) = setup("old\n");
        let mut stream = tool.follow(&path, "utf-8").await.unwrap();

        backend.append("/log", "new 1\nnew ");
        backend.append("/log", "2\n");
        assert_eq!(stream.recv().await.as_deref(), Some("new 1"));
        assert_eq!(stream.recv().await.as_deref(), Some("new 2"));

        stream.cancel();
        backend.append("/log", "late\n");
        assert_eq!(stream.recv().await, None);
    }
}
