//! Tracing subscriber setup
//!
//! Shared tracing configuration used by the `rwin` binary and by tests.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber, logging to `log_file_path`.
///
/// Filtering follows RUST_LOG with a DEBUG default.
pub fn init_global(log_file_path: &Path) -> io::Result<()> {
    let log_file = File::create(log_file_path)?;
    build_subscriber(Arc::new(log_file)).init();
    Ok(())
}

/// Initialize the global subscriber, logging to stderr.
pub fn init_stderr() {
    let _ = build_subscriber(io::stderr).try_init();
}

/// Build a subscriber writing formatted events to `writer`.
pub fn build_subscriber<W>(writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter = EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into());

    let fmt_layer = fmt::layer().with_writer(writer).with_ansi(false);

    tracing_subscriber::registry().with(fmt_layer).with(env_filter)
}
