//! Docker API wrapper using the bollard crate.
//!
//! This module provides the [`ContainerRuntime`] implementation backed by
//! the local Docker daemon.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::execution::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, MANAGED_LABEL};

/// Docker client wrapper for container operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connects to the local Docker daemon (`DOCKER_HOST` or the default
    /// socket) and negotiates the API version.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        let docker = docker.negotiate_version().await.map_err(|e| {
            RuntimeError::DaemonUnavailable(format!("Failed to negotiate API version: {e}"))
        })?;

        info!(api_version = ?docker.client_version(), "Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Removes every container labelled as managed by this crate.
    ///
    /// Used on shutdown when `cleanup_on_exit` is set. Returns the number of
    /// containers removed; individual failures are logged and skipped.
    pub async fn remove_managed_containers(&self) -> Result<usize, RuntimeError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        )]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Api(format!("Failed to list containers: {e}")))?;

        let mut removed = 0;
        for id in containers.into_iter().filter_map(|c| c.id) {
            match self.remove_container(&id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %id, error = %e, "Failed to remove leftover container"),
            }
        }

        Ok(removed)
    }
}

/// Builds the Docker host configuration for a sandbox container.
pub fn host_config(spec: &ContainerSpec) -> HostConfig {
    HostConfig {
        memory: Some(spec.limits.memory_bytes()),
        memory_swap: Some(spec.limits.memory_swap_bytes()),
        cpu_period: Some(spec.limits.cpu_period()),
        cpu_quota: Some(spec.limits.cpu_quota()),
        network_mode: Some(if spec.network_enabled { "bridge" } else { "none" }.to_string()),
        binds: if spec.binds.is_empty() {
            None
        } else {
            Some(spec.binds.clone())
        },
        tmpfs: if spec.tmpfs.is_empty() {
            None
        } else {
            Some(spec.tmpfs.clone())
        },
        auto_remove: Some(false),
        ..Default::default()
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn inspect_image(&self, image: &str) -> Result<(), RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Err(RuntimeError::ImageNotFound(image.to_string())),
            Err(e) => Err(RuntimeError::Api(format!("Failed to inspect image: {e}"))),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            let info =
                result.map_err(|e| RuntimeError::Stream(format!("Failed to pull image: {e}")))?;
            if let Some(status) = info.status {
                debug!(image, status = %status, "Pull progress");
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            network_disabled: Some(!spec.network_enabled),
            host_config: Some(host_config(spec)),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| RuntimeError::Api(format!("Failed to create container: {e}")))?;

        for warning in &response.warnings {
            warn!(container = %response.id, warning = %warning, "Docker warning on create");
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Api(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        cmd: &[String],
        working_dir: Option<&str>,
    ) -> Result<ExecOutput, RuntimeError> {
        let exec_options = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            working_dir: working_dir.map(str::to_string),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| RuntimeError::Api(format!("Failed to create exec: {e}")))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::Api(format!("Failed to start exec: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(RuntimeError::Stream(format!("Error reading output: {e}")));
                    }
                }
            }
        }

        // Get exit code from exec inspect
        let exec_info = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::Api(format!("Failed to inspect exec: {e}")))?;

        let exit_code = exec_info.exit_code.unwrap_or(-1);

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true, // Remove volumes
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| RuntimeError::Api(format!("Failed to remove container: {e}")))?;

        Ok(())
    }
}
