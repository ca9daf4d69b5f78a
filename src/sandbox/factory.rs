//! Registry of sandbox backends.
//!
//! Callers ask the factory for a sandbox by backend name so the transport
//! layer never depends on a particular isolation mechanism.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{Sandbox, SandboxConfig};
use crate::error::SandboxError;

/// Produces sandboxes for one isolation backend.
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Backend name used as the registry key, e.g. `docker`.
    fn name(&self) -> &str;

    /// Builds a sandbox bound to `config`. No environment resources are
    /// allocated until the sandbox executes.
    async fn create(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>, SandboxError>;
}

/// Backend registry keyed by provider name.
#[derive(Default, Clone)]
pub struct SandboxFactory {
    providers: HashMap<String, Arc<dyn EnvironmentProvider>>,
}

impl SandboxFactory {
    /// Creates an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `provider` under its own name, replacing any previous one.
    pub fn register(&mut self, provider: Arc<dyn EnvironmentProvider>) {
        let name = provider.name().to_string();
        debug!(engine = %name, "Registered sandbox provider");
        self.providers.insert(name, provider);
    }

    /// Builder-style [`Self::register`].
    pub fn with_provider(mut self, provider: Arc<dyn EnvironmentProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Names of the registered backends, sorted.
    pub fn engines(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Creates a sandbox with the backend registered as `engine`.
    pub async fn create(
        &self,
        engine: &str,
        config: SandboxConfig,
    ) -> Result<Box<dyn Sandbox>, SandboxError> {
        let provider = self
            .providers
            .get(engine)
            .ok_or_else(|| SandboxError::NoCreator(engine.to_string()))?;
        provider.create(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::resources::ResourceLimits;
    use crate::sandbox::{ExecutionResult, RetryPolicy};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct EchoSandbox {
        language: String,
    }

    #[async_trait]
    impl Sandbox for EchoSandbox {
        async fn execute(
            &self,
            code: &str,
            _cancel: &CancellationToken,
        ) -> Result<ExecutionResult, SandboxError> {
            Ok(ExecutionResult {
                stdout: format!("{}:{}", self.language, code),
                stderr: String::new(),
                exit_code: 0,
                duration: Duration::ZERO,
            })
        }

        async fn cleanup(&self, _cancel: &CancellationToken) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    struct EchoProvider;

    #[async_trait]
    impl EnvironmentProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn create(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>, SandboxError> {
            Ok(Box::new(EchoSandbox {
                language: config.language,
            }))
        }
    }

    fn config() -> SandboxConfig {
        SandboxConfig {
            language: "bash".to_string(),
            version: "5".to_string(),
            image: "bash:5".to_string(),
            entrypoint: vec!["sh".into(), "-c".into(), "bash {exec_file}".into()],
            suffix: "sh".to_string(),
            limits: ResourceLimits::default(),
            network_enabled: false,
            timeout: Duration::from_secs(5),
            work_dir: PathBuf::from("/tmp"),
            retry: RetryPolicy::default(),
        }
    }

    #[tokio::test]
    async fn test_create_without_provider_fails() {
        let factory = SandboxFactory::new();
        let err = factory.create("docker", config()).await.err().unwrap();
        assert!(matches!(err, SandboxError::NoCreator(ref name) if name == "docker"));
    }

    #[tokio::test]
    async fn test_create_dispatches_to_named_provider() {
        let factory = SandboxFactory::new().with_provider(Arc::new(EchoProvider));
        assert_eq!(factory.engines(), vec!["echo".to_string()]);

        let sandbox = factory.create("echo", config()).await.unwrap();
        let result = sandbox
            .execute("exit 7", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.stdout, "bash:exit 7");

        assert!(factory.create("docker", config()).await.is_err());
    }
}
