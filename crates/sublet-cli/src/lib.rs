//! Demo works and the communication managers they use.

pub mod progress;
pub mod works;
