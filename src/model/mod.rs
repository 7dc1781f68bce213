//! Pure data structures for windowed file content
//!
//! Nothing in here performs I/O.

pub mod chunk_cache;
pub mod line_split;
pub mod pattern;
pub mod text_encoding;
