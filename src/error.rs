//! Error types for code-sandbox operations.
//!
//! Defines error types for each subsystem:
//! - Sandbox lifecycle (configuration, provisioning, execution, teardown)
//! - Container runtime calls
//! - Configuration file loading

use std::time::Duration;

use thiserror::Error;

use crate::sandbox::retry::RetryError;

/// Errors surfaced by a sandbox execution.
///
/// Only the first fatal condition of a call is surfaced. A command that
/// exits non-zero or overruns its CPU-time ceiling is not an error; both are
/// reported through [`crate::sandbox::ExecutionResult`].
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Provisioning failed while trying to {stage}: {source}")]
    Provisioning {
        stage: &'static str,
        #[source]
        source: RuntimeError,
    },

    #[error("Execution failed: {0}")]
    Execution(#[source] RuntimeError),

    #[error("Failed to remove container {id}: {source}")]
    Teardown {
        id: String,
        #[source]
        source: RetryError<RuntimeError>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Sandbox run exceeded its total timeout of {limit:?}")]
    Timeout { limit: Duration },

    #[error("No sandbox creator configured for engine '{0}'")]
    NoCreator(String),

    #[error("Workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

impl SandboxError {
    /// Short machine-readable category, used by the tool server.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Configuration(_) => "configuration",
            SandboxError::Template(_) => "template",
            SandboxError::Provisioning { .. } => "provisioning",
            SandboxError::Execution(_) => "execution",
            SandboxError::Teardown { .. } => "teardown",
            SandboxError::Cancelled => "cancelled",
            SandboxError::Timeout { .. } => "timeout",
            SandboxError::NoCreator(_) => "no_creator",
            SandboxError::Workspace(_) => "workspace",
        }
    }
}

/// Errors returned by a container runtime backend.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Container runtime not available: {0}")]
    DaemonUnavailable(String),

    #[error("Image '{0}' not found")]
    ImageNotFound(String),

    #[error("Container runtime API error: {0}")]
    Api(String),

    #[error("Error reading runtime stream: {0}")]
    Stream(String),
}

/// Errors that can occur while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
