// External line-oriented utilities
//
// The browse engine never reads large files itself: range extraction, line
// counting, pattern matching and tailing are delegated to an
// `ExternalLineTool`. Command construction per host OS lives in the
// `CommandSyntax` adapters; `MemoryLineTool` serves the in-memory backend.

pub mod command;
pub mod memory;
pub mod unix;
pub mod windows;

pub use command::{CommandLineTool, CommandSpec, CommandSyntax};
pub use memory::MemoryLineTool;
pub use unix::UnixSyntax;
pub use windows::WindowsSyntax;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{EngineError, EngineResult};
use crate::model::pattern::PatternSpec;
use crate::model::text_encoding::TextEncoding;
use crate::services::remote::RemotePath;

/// What a bounded invocation should produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineQuery {
    /// Lines `[start, end)`, 0-based, one per output line
    Range { start: usize, end: usize },
    /// Total number of lines, as a single number
    CountLines,
    /// Matching lines as `N:text`, N 1-based
    Match(PatternSpec),
}

impl LineQuery {
    pub fn operation(&self) -> &'static str {
        match self {
            LineQuery::Range { .. } => "extract lines",
            LineQuery::CountLines => "count lines",
            LineQuery::Match(_) => "match lines",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRequest {
    pub path: RemotePath,
    pub query: LineQuery,
    /// Encoding of the file; output is decoded with it
    pub encoding: String,
}

impl LineRequest {
    pub fn new(path: RemotePath, query: LineQuery) -> Self {
        Self {
            path,
            query,
            encoding: TextEncoding::Utf8.label().to_string(),
        }
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub(crate) fn text_encoding(&self) -> EngineResult<TextEncoding> {
        output_encoding(&self.encoding, self.query.operation(), &self.path)
    }
}

/// Resolve the encoding tool output is decoded with.
pub(crate) fn output_encoding(
    label: &str,
    operation: &'static str,
    path: &RemotePath,
) -> EngineResult<TextEncoding> {
    TextEncoding::from_label(label).map_err(|e| EngineError::unknown(operation, path, e.to_string()))
}

/// Strip the line terminator from one raw output line and decode it.
pub(crate) fn decode_line(mut raw: &[u8], encoding: TextEncoding) -> String {
    if let Some(rest) = raw.strip_suffix(b"\n") {
        raw = rest;
    }
    if let Some(rest) = raw.strip_suffix(b"\r") {
        raw = rest;
    }
    encoding.decode_lossy(raw)
}

/// Captured output of a completed invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Human-readable rendition of what ran, for diagnostics
    pub command: String,
    pub stdout: String,
}

impl ToolOutput {
    pub fn lines(&self) -> Vec<String> {
        self.stdout.lines().map(str::to_string).collect()
    }

    /// Parse the output of a `CountLines` query.
    pub fn line_count(&self) -> EngineResult<usize> {
        self.stdout
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| EngineError::Command {
                command: self.command.clone(),
                exit_code: Some(0),
                stderr: format!("unexpected line count output {:?}", self.stdout.trim()),
            })
    }
}

/// Live output of an unbounded ("follow") invocation.
///
/// Dropping or cancelling the stream terminates the underlying producer; no
/// lines are delivered after cancellation.
#[derive(Debug)]
pub struct LineStream {
    lines: mpsc::Receiver<String>,
    producer: Option<JoinHandle<()>>,
}

impl LineStream {
    pub fn new(lines: mpsc::Receiver<String>, producer: JoinHandle<()>) -> Self {
        Self {
            lines,
            producer: Some(producer),
        }
    }

    /// Next line, or `None` once the producer has terminated.
    pub async fn recv(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Wait for at least one line and take up to `limit` queued lines.
    pub async fn recv_many(&mut self, buffer: &mut Vec<String>, limit: usize) -> usize {
        self.lines.recv_many(buffer, limit).await
    }

    pub fn cancel(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
        self.lines.close();
        while self.lines.try_recv().is_ok() {}
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

#[async_trait]
pub trait ExternalLineTool: Send + Sync {
    /// Run a bounded invocation to completion and capture its output
    async fn run(&self, request: &LineRequest) -> EngineResult<ToolOutput>;

    /// Start following appended lines of `path`, beginning at the current end
    async fn follow(&self, path: &RemotePath, encoding: &str) -> EngineResult<LineStream>;
}
