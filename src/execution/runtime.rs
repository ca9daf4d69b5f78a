//! The container runtime seam used by the lifecycle engine.
//!
//! [`crate::execution::DockerClient`] is the production implementation.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::execution::resources::ResourceLimits;

/// Label set on every container created by this crate.
pub const MANAGED_LABEL: &str = "code-sandbox.managed";

/// Label carrying the language of the sandbox.
pub const LANGUAGE_LABEL: &str = "code-sandbox.language";

/// Everything needed to create one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Long-running placeholder command.
    pub cmd: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Bind mounts in `host:container[:opts]` format.
    pub binds: Vec<String>,
    /// tmpfs mounts, container path to mount options.
    pub tmpfs: HashMap<String, String>,
    /// Resource ceilings.
    pub limits: ResourceLimits,
    /// Whether the container gets a network.
    pub network_enabled: bool,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Creates a spec with the given name and image and no mounts.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: Vec::new(),
            working_dir: None,
            binds: Vec::new(),
            tmpfs: HashMap::new(),
            limits: ResourceLimits::default(),
            network_enabled: false,
            labels: HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
        }
    }

    /// Sets the container command.
    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Sets the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds a bind mount exposing `host` at `container`.
    pub fn with_bind(mut self, host: impl AsRef<str>, container: impl AsRef<str>) -> Self {
        self.binds
            .push(format!("{}:{}", host.as_ref(), container.as_ref()));
        self
    }

    /// Adds a tmpfs mount.
    pub fn with_tmpfs(mut self, path: impl Into<String>, options: impl Into<String>) -> Self {
        self.tmpfs.insert(path.into(), options.into());
        self
    }

    /// Sets explicit resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Enables or disables networking.
    pub fn with_network(mut self, enabled: bool) -> Self {
        self.network_enabled = enabled;
        self
    }

    /// Adds a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Output of a command executed inside a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code of the command.
    pub exit_code: i64,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
}

/// Operations the lifecycle engine needs from a container runtime.
///
/// None of these calls retry; retries and deadlines are the engine's job.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Checks that `image` is present locally.
    ///
    /// Must return [`RuntimeError::ImageNotFound`] when, and only when, the
    /// runtime reports the image as missing.
    async fn inspect_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Pulls `image`, returning only after the pull stream is fully drained.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Runs `cmd` inside a running container and collects its output and
    /// exit code.
    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        working_dir: Option<&str>,
    ) -> Result<ExecOutput, RuntimeError>;

    /// Force-removes a container together with its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}
