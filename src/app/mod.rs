//! Per-file engines and the coordinator that arbitrates between them

pub mod browse;
pub mod edit;
pub mod mode;
