//! Asynchronous services and external integrations
//!
//! This module contains all code that deals with the remote file service,
//! external line tools, polling and logging.

pub mod file_watcher;
pub mod line_tool;
pub mod remote;
pub mod time_source;
pub mod tracing_setup;
