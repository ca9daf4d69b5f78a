//! Container execution layer.
//!
//! This module runs sandboxes inside Docker containers using the bollard
//! crate: resource translation, the runtime seam, and the lifecycle engine.
//!
//! # Architecture
//!
//! ```text
//! ContainerProvider ──creates──▶ ContainerSandbox ──calls──▶ dyn ContainerRuntime
//!                                                                  ▲
//!                                                             DockerClient
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use code_sandbox::execution::{ContainerProvider, DockerClient};
//! use code_sandbox::sandbox::SandboxFactory;
//!
//! let client = DockerClient::connect().await?;
//! let factory = SandboxFactory::new()
//!     .with_provider(Arc::new(ContainerProvider::new(Arc::new(client))));
//! let sandbox = factory.create("docker", config).await?;
//! let result = sandbox.execute("echo hi", &CancellationToken::new()).await?;
//! ```

pub mod container;
pub mod docker_client;
pub mod provider;
pub mod resources;
pub mod runtime;

pub use container::{ContainerSandbox, LifecycleState};
pub use docker_client::DockerClient;
pub use provider::{ContainerProvider, DOCKER_ENGINE};
pub use resources::ResourceLimits;
pub use runtime::{ContainerRuntime, ContainerSpec, ExecOutput};
