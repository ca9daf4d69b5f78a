//! code-sandbox: run code snippets inside disposable Docker containers.
//!
//! The library resolves a language into an image and command, provisions a
//! resource-limited container, runs the snippet under a deadline, and
//! always tears the container down afterwards. A stdio tool server and a
//! CLI sit on top.

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod sandbox;
pub mod server;
pub mod workspace;

pub use error::{ConfigError, RuntimeError, SandboxError};
pub use sandbox::{ExecutionResult, Sandbox, SandboxConfig, SandboxFactory};
