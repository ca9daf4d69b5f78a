//! Command-line interface for code-sandbox.
//!
//! Provides the stdio tool server plus direct execution and inspection
//! commands.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
