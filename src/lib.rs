//! Session automation engine.
//!
//! Scans a base directory for projects and, for each one, resumes the coding
//! agent's most recent session or bootstraps a new one, then feeds it
//! instruction payloads. Units run in parallel up to a configured limit and
//! fail independently.

pub mod agent;
pub mod cli;
pub mod config;
pub mod error;
pub mod injector;
pub mod log;
pub mod paths;
pub mod payload;
pub mod prompt;
pub mod report;
pub mod scanner;
pub mod scheduler;
pub mod session;
pub mod stages;
pub mod terminal;
pub mod tmux;
pub mod waiter;
