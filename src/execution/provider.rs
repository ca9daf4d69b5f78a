//! Docker-backed [`EnvironmentProvider`].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::SandboxError;
use crate::execution::container::ContainerSandbox;
use crate::execution::runtime::ContainerRuntime;
use crate::sandbox::{EnvironmentProvider, Sandbox, SandboxConfig};

/// Registry name of the container backend.
pub const DOCKER_ENGINE: &str = "docker";

/// Builds [`ContainerSandbox`]es over one shared runtime handle.
pub struct ContainerProvider {
    name: String,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerProvider {
    /// Creates a provider registered as `docker`.
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            name: DOCKER_ENGINE.to_string(),
            runtime,
        }
    }

    /// Overrides the registry name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl EnvironmentProvider for ContainerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>, SandboxError> {
        config.validate()?;
        debug!(
            language = %config.language,
            version = %config.version,
            image = %config.image,
            "Creating container sandbox"
        );
        Ok(Box::new(ContainerSandbox::new(
            Arc::clone(&self.runtime),
            config,
        )))
    }
}
