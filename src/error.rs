//! Error taxonomy shared by every engine.
//!
//! Engines surface failures as `EngineError` values carrying enough context
//! (operation, path or command, underlying cause) for the caller to decide
//! between reporting, retrying or reconnecting. The type is `Clone` so that a
//! single coalesced fetch can hand its failure to every waiter.

use std::io;
use std::time::Duration;

use crate::app::mode::Mode;
use crate::services::remote::RemotePath;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("{operation} {path}: not found")]
    NotFound {
        operation: &'static str,
        path: String,
    },

    #[error("{operation} {path}: permission denied")]
    PermissionDenied {
        operation: &'static str,
        path: String,
    },

    /// A full read was requested for a file larger than the configured ceiling.
    #[error("{path} is {size} bytes, above the full-load ceiling of {limit} bytes")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    #[error("invalid pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    #[error("command `{command}` failed (exit {}): {stderr}", exit_label(.exit_code))]
    Command {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{operation} {target} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        target: String,
        after: Duration,
    },

    #[error("a switch to {target} is already in progress")]
    SwitchInProgress { target: Mode },

    /// Switching to edit mode failed because the file exceeds the full-load ceiling.
    #[error("cannot edit {path}: {size} bytes exceeds the {limit} byte edit limit")]
    LoadTooLarge { path: String, size: u64, limit: u64 },

    /// A newer request replaced this one before it completed.
    #[error("{operation} was superseded by a newer request")]
    Superseded { operation: &'static str },

    #[error("{operation} {path}: {message}")]
    Unknown {
        operation: &'static str,
        path: String,
        message: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl EngineError {
    /// Classify an I/O error raised while performing `operation` on `path`.
    pub fn from_io(operation: &'static str, path: &RemotePath, err: &io::Error) -> Self {
        let path = path.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => EngineError::NotFound { operation, path },
            io::ErrorKind::PermissionDenied => EngineError::PermissionDenied { operation, path },
            io::ErrorKind::TimedOut => EngineError::Timeout {
                operation,
                target: path,
                after: Duration::ZERO,
            },
            _ => EngineError::Unknown {
                operation,
                path,
                message: err.to_string(),
            },
        }
    }

    pub fn unknown(operation: &'static str, path: &RemotePath, message: impl Into<String>) -> Self {
        EngineError::Unknown {
            operation,
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout { .. }
                | EngineError::Command { .. }
                | EngineError::Unknown { .. }
                | EngineError::SwitchInProgress { .. }
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
