//! Command-line interface for qrelay.
//!
//! Provides commands for enqueueing shell commands, running the worker,
//! and listing resolved queues.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
