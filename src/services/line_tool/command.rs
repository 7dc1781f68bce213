//! Line tool backed by host processes.
//!
//! `CommandSyntax` adapters turn a `LineQuery` into a program + arguments for
//! one host OS; `CommandLineTool` spawns it with tokio, bounds the wait, and
//! classifies the exit status. Children are spawned with `kill_on_drop`, so
//! dropping an invocation (timeout, supersession, cancelled follow) kills the
//! process.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{decode_line, output_encoding};
use super::{ExternalLineTool, LineQuery, LineRequest, LineStream, ToolOutput};
use super::{UnixSyntax, WindowsSyntax};
use crate::error::{EngineError, EngineResult};
use crate::model::pattern::PatternSpec;
use crate::services::remote::RemotePath;

/// Capacity of the channel between a follow process and its consumer
const FOLLOW_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Per-OS command construction
pub trait CommandSyntax: Send + Sync + fmt::Debug {
    /// Print lines `[start, end)` (0-based), `start < end`
    fn range(&self, path: &str, start: usize, end: usize) -> CommandSpec;

    fn count_lines(&self, path: &str) -> CommandSpec;

    /// Print matching lines prefixed by their 1-based number and a colon
    fn matching(&self, path: &str, pattern: &PatternSpec) -> CommandSpec;

    /// Print lines appended after the current end, forever
    fn follow(&self, path: &str) -> CommandSpec;

    /// Whether an exit code means the query succeeded
    fn is_success(&self, query: &LineQuery, exit_code: Option<i32>) -> bool {
        let _ = query;
        exit_code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct CommandLineTool {
    syntax: Arc<dyn CommandSyntax>,
    timeout: Duration,
}

impl CommandLineTool {
    pub fn new(syntax: Arc<dyn CommandSyntax>, timeout: Duration) -> Self {
        Self { syntax, timeout }
    }

    /// Tool using the syntax of the host this process runs on
    pub fn for_host(timeout: Duration) -> Self {
        let syntax: Arc<dyn CommandSyntax> = if cfg!(windows) {
            Arc::new(WindowsSyntax)
        } else {
            Arc::new(UnixSyntax)
        };
        Self::new(syntax, timeout)
    }

    pub fn build(&self, request: &LineRequest) -> CommandSpec {
        let path = request.path.path.as_str();
        match &request.query {
            LineQuery::Range { start, end } => self.syntax.range(path, *start, *end),
            LineQuery::CountLines => self.syntax.count_lines(path),
            LineQuery::Match(pattern) => self.syntax.matching(path, pattern),
        }
    }
}

#[async_trait]
impl ExternalLineTool for CommandLineTool {
    async fn run(&self, request: &LineRequest) -> EngineResult<ToolOutput> {
        let encoding = request.text_encoding()?;
        let spec = self.build(request);
        let command = spec.to_string();
        if let LineQuery::Range { start, end } = request.query {
            if start >= end {
                return Ok(ToolOutput {
                    command,
                    stdout: String::new(),
                });
            }
        }

        tracing::debug!("Running line tool: {}", command);
        let child = spec.to_command().spawn().map_err(|e| EngineError::Command {
            command: command.clone(),
            exit_code: None,
            stderr: format!("failed to spawn: {}", e),
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(EngineError::Command {
                    command,
                    exit_code: None,
                    stderr: e.to_string(),
                })
            }
            Err(_) => {
                tracing::warn!("Line tool timed out after {:?}: {}", self.timeout, command);
                return Err(EngineError::Timeout {
                    operation: request.query.operation(),
                    target: command,
                    after: self.timeout,
                });
            }
        };

        let exit_code = output.status.code();
        if !self.syntax.is_success(&request.query, exit_code) {
            return Err(EngineError::Command {
                command,
                exit_code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(ToolOutput {
            command,
            stdout: encoding.decode_lossy(&output.stdout),
        })
    }

    async fn follow(&self, path: &RemotePath, encoding: &str) -> EngineResult<LineStream> {
        let encoding = output_encoding(encoding, "follow", path)?;
        let spec = self.syntax.follow(&path.path);
        let command = spec.to_string();
        let mut child = spec.to_command().spawn().map_err(|e| EngineError::Command {
            command: command.clone(),
            exit_code: None,
            stderr: format!("failed to spawn: {}", e),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| EngineError::Command {
            command: command.clone(),
            exit_code: None,
            stderr: "no stdout from child".to_string(),
        })?;

        let (tx, rx) = mpsc::channel(FOLLOW_CHANNEL_CAPACITY);
        let producer = tokio::spawn(async move {
            // The child lives in this task; aborting the task kills it.
            let mut child = child;
            let mut reader = BufReader::new(stdout);
            let mut raw = Vec::new();
            loop {
                raw.clear();
                match reader.read_until(b'\n', &mut raw).await {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(decode_line(&raw, encoding)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Follow stream for {} failed: {}", command, e);
                        break;
                    }
                }
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
        });

        Ok(LineStream::new(rx, producer))
    }
}
