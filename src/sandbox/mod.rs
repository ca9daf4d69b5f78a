//! Backend-agnostic sandbox abstractions.
//!
//! A [`Sandbox`] runs one snippet of code in an isolated, disposable
//! environment described by a [`SandboxConfig`] and reports an
//! [`ExecutionResult`]. Backends are plugged in through
//! [`factory::EnvironmentProvider`].
//!
//! # Example
//!
//! ```ignore
//! use code_sandbox::sandbox::SandboxFactory;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = settings.resolve("python", None)?;
//! let sandbox = factory.create("docker", config).await?;
//! let result = sandbox.execute("print(1+1)", &CancellationToken::new()).await?;
//! assert_eq!(result.stdout, "2\n");
//! ```

pub mod factory;
pub mod retry;
pub mod template;

pub use factory::{EnvironmentProvider, SandboxFactory};
pub use retry::{RetryError, RetryPolicy};

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::SandboxError;
use crate::execution::resources::ResourceLimits;

/// Exit code reported when the command overruns its CPU-time ceiling.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Standard error reported when the command overruns its CPU-time ceiling.
pub const TIMEOUT_STDERR: &str = "command execution timeout";

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code of the command.
    pub exit_code: i64,
    /// Elapsed wall-clock time.
    pub duration: Duration,
}

impl ExecutionResult {
    /// The result reported when the command ran past `ceiling`.
    pub fn timed_out(ceiling: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: TIMEOUT_STDERR.to_string(),
            exit_code: TIMEOUT_EXIT_CODE,
            duration: ceiling,
        }
    }

    /// Whether this result is the synthesized timeout outcome.
    pub fn is_timeout(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE && self.stderr == TIMEOUT_STDERR
    }
}

/// Fully-resolved description of one execution.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Language identifier, e.g. `python`.
    pub language: String,
    /// Runtime version, already defaulted.
    pub version: String,
    /// Resolved image reference.
    pub image: String,
    /// Three-token entrypoint template.
    pub entrypoint: Vec<String>,
    /// Source file extension without the dot.
    pub suffix: String,
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Whether the container gets a network.
    pub network_enabled: bool,
    /// Total wall-clock budget for provisioning and running. Zero disables it.
    pub timeout: Duration,
    /// Directory under which per-execution workspaces are created.
    pub work_dir: PathBuf,
    /// Retry policy for teardown.
    pub retry: RetryPolicy,
}

impl SandboxConfig {
    /// Name of the source file written into the workspace.
    pub fn source_file_name(&self) -> String {
        format!("main.{}", self.suffix)
    }

    /// Checks the configuration before any environment is created.
    ///
    /// Rejects entrypoints without exactly three tokens, entrypoint
    /// templates that do not render, and unusable suffixes.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.language.trim().is_empty() {
            return Err(SandboxError::Configuration("language is empty".to_string()));
        }
        if self.image.trim().is_empty() {
            return Err(SandboxError::Configuration(format!(
                "no image resolved for language '{}'",
                self.language
            )));
        }
        if self.suffix.is_empty() || self.suffix.contains(['/', '\\']) || self.suffix.contains("..")
        {
            return Err(SandboxError::Configuration(format!(
                "invalid source suffix '{}' for language '{}'",
                self.suffix, self.language
            )));
        }

        // Dry run with placeholder paths to surface malformed templates early.
        let probe = self.work_dir.join("probe");
        template::resolve_command(&self.entrypoint, &probe, &probe.join(self.source_file_name()))?;
        Ok(())
    }
}

/// An isolated, disposable execution environment.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Runs `code` and returns its result. The environment is torn down
    /// before this returns, whatever the outcome.
    async fn execute(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError>;

    /// Releases every resource held by the environment. Idempotent.
    async fn cleanup(&self, cancel: &CancellationToken) -> Result<(), SandboxError>;
}
