//! Infrastructure layer: job persistence and execution, configuration.

pub mod config;
pub mod jobs;
