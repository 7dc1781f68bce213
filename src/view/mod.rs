//! Viewport scheduling

pub mod virtual_scroll;
