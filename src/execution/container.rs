//! Container lifecycle management for sandbox execution.
//!
//! [`ContainerSandbox`] drives one execution from image check to teardown:
//!
//! ```text
//! UNINITIALIZED → IMAGE_READY → CREATED → STARTED → EXEC_DISPATCHED → RESULT_CAPTURED → CLEANED
//!        └──────────────┴───────────┴─────────┴──────────────┴──→ FAILED → CLEANED
//! ```
//!
//! Teardown runs on every exit path of [`Sandbox::execute`] and is
//! idempotent, so a caller may also invoke [`Sandbox::cleanup`] afterwards.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RuntimeError, SandboxError};
use crate::execution::runtime::{ContainerRuntime, ContainerSpec, LANGUAGE_LABEL};
use crate::sandbox::retry::RetryError;
use crate::sandbox::{template, ExecutionResult, Sandbox, SandboxConfig};
use crate::workspace::TempWorkspace;

/// Command that keeps the container alive until the exec step.
pub const PLACEHOLDER_CMD: [&str; 3] = ["tail", "-f", "/dev/null"];

type Deadline = tokio::time::Instant;

/// Permissions of the written source file.
const SOURCE_FILE_MODE: u32 = 0o644;

/// Lifecycle state of a sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing has happened yet.
    Uninitialized,
    /// The image is present locally.
    ImageReady,
    /// The container exists but is not running.
    Created,
    /// The container is running the placeholder command.
    Started,
    /// The user command has been dispatched.
    ExecDispatched,
    /// Output and exit code (or the timeout outcome) are known.
    ResultCaptured,
    /// A step failed; carries the error category.
    Failed(String),
    /// The container has been removed.
    Cleaned,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Uninitialized => write!(f, "uninitialized"),
            LifecycleState::ImageReady => write!(f, "image-ready"),
            LifecycleState::Created => write!(f, "created"),
            LifecycleState::Started => write!(f, "started"),
            LifecycleState::ExecDispatched => write!(f, "exec-dispatched"),
            LifecycleState::ResultCaptured => write!(f, "result-captured"),
            LifecycleState::Failed(kind) => write!(f, "failed: {}", kind),
            LifecycleState::Cleaned => write!(f, "cleaned"),
        }
    }
}

#[derive(Debug)]
struct EnvironmentState {
    container_id: Option<String>,
    cleaned: bool,
    /// Set by the first `execute`.
    claimed: bool,
    lifecycle: LifecycleState,
}

/// A sandbox backed by one disposable container.
pub struct ContainerSandbox {
    runtime: Arc<dyn ContainerRuntime>,
    config: SandboxConfig,
    state: Mutex<EnvironmentState>,
}

impl ContainerSandbox {
    /// Creates a sandbox bound to `config`. No container exists until
    /// [`Sandbox::execute`] runs.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: SandboxConfig) -> Self {
        Self {
            runtime,
            config,
            state: Mutex::new(EnvironmentState {
                container_id: None,
                cleaned: false,
                claimed: false,
                lifecycle: LifecycleState::Uninitialized,
            }),
        }
    }

    /// Returns the sandbox configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    pub async fn lifecycle(&self) -> LifecycleState {
        self.state.lock().await.lifecycle.clone()
    }

    /// Returns the container id, if one is currently held.
    pub async fn container_id(&self) -> Option<String> {
        self.state.lock().await.container_id.clone()
    }

    async fn transition(&self, next: LifecycleState) {
        let mut state = self.state.lock().await;
        debug!(from = %state.lifecycle, to = %next, "Sandbox state change");
        state.lifecycle = next;
    }

    /// Makes sure the image is present, pulling it only when the runtime
    /// reports it missing.
    async fn ensure_image(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Deadline>,
    ) -> Result<(), SandboxError> {
        let image = &self.config.image;

        match self.step(cancel, deadline, self.runtime.inspect_image(image)).await? {
            Ok(()) => {
                debug!(image = %image, "Image already present, skipping pull");
                Ok(())
            }
            Err(RuntimeError::ImageNotFound(_)) => {
                info!(image = %image, "Pulling image");
                self.step(cancel, deadline, self.runtime.pull_image(image))
                    .await?
                    .map_err(|source| SandboxError::Provisioning {
                        stage: "pull image",
                        source,
                    })?;
                info!(image = %image, "Image pulled");
                Ok(())
            }
            Err(source) => {
                error!(image = %image, error = %source, "Failed to inspect image");
                Err(SandboxError::Provisioning {
                    stage: "inspect image",
                    source,
                })
            }
        }
    }

    /// Runs one cancellable wait, bounded by the total deadline if any.
    async fn step<F, T>(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Deadline>,
        fut: F,
    ) -> Result<T, SandboxError>
    where
        F: Future<Output = T>,
    {
        let fut = cancellable(cancel, fut);
        match deadline {
            None => fut.await,
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| self.total_timeout())?,
        }
    }

    fn total_timeout(&self) -> SandboxError {
        SandboxError::Timeout {
            limit: self.config.timeout,
        }
    }

    fn container_name(&self) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                        c
                    } else {
                        '-'
                    }
                })
                .collect()
        };
        format!(
            "sandbox_{}_{}_{}",
            sanitize(&self.config.language),
            sanitize(&self.config.version),
            Uuid::new_v4()
        )
    }

    /// Container spec for one execution.
    ///
    /// The source file is bind-mounted at its host path. The workspace
    /// directory itself is a size-capped tmpfs when a disk ceiling is set,
    /// otherwise it is bind-mounted as a whole.
    fn container_spec(&self, workspace_dir: &Path, source_file: &Path) -> ContainerSpec {
        let dir = workspace_dir.to_string_lossy();
        let spec = ContainerSpec::new(self.container_name(), &self.config.image)
            .with_cmd(PLACEHOLDER_CMD.iter().map(|s| s.to_string()).collect())
            .with_working_dir(&*dir)
            .with_limits(self.config.limits.clone())
            .with_network(self.config.network_enabled)
            .with_label(LANGUAGE_LABEL, &self.config.language);

        match self.config.limits.workspace_tmpfs_options() {
            Some(options) => {
                let file = source_file.to_string_lossy();
                spec.with_tmpfs(&*dir, options)
                    .with_bind(&*file, &*file)
            }
            None => spec.with_bind(&*dir, &*dir),
        }
    }

    async fn provision_and_run(
        &self,
        code: &str,
        cancel: &CancellationToken,
        started: Instant,
        deadline: Option<Deadline>,
        workspace: &mut Option<TempWorkspace>,
    ) -> Result<ExecutionResult, SandboxError> {
        self.ensure_image(cancel, deadline).await?;
        self.transition(LifecycleState::ImageReady).await;

        let ws = workspace.insert(TempWorkspace::create(&self.config.work_dir)?);
        let source_file =
            ws.write_file(&self.config.source_file_name(), code.as_bytes(), SOURCE_FILE_MODE)?;
        debug!(path = %source_file.display(), "Wrote source file");

        let spec = self.container_spec(ws.dir(), &source_file);

        // Neither cancellation nor the deadline may interrupt create: an
        // abandoned call could leave a container nobody knows the id of.
        let id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|source| SandboxError::Provisioning {
                stage: "create container",
                source,
            })?;
        {
            let mut state = self.state.lock().await;
            state.container_id = Some(id.clone());
            state.lifecycle = LifecycleState::Created;
        }
        info!(container = %id, name = %spec.name, image = %spec.image, "Container created");

        if deadline.is_some_and(|at| Deadline::now() >= at) {
            return Err(self.total_timeout());
        }

        self.step(cancel, deadline, self.runtime.start_container(&id))
            .await?
            .map_err(|source| SandboxError::Provisioning {
                stage: "start container",
                source,
            })?;
        self.transition(LifecycleState::Started).await;

        let cmd = template::resolve_command(&self.config.entrypoint, ws.dir(), &source_file)?;
        let working_dir = ws.dir().to_string_lossy().to_string();

        self.transition(LifecycleState::ExecDispatched).await;
        let ceiling = self.config.limits.cpu_timeout;
        debug!(container = %id, cmd = ?cmd, timeout_ms = ceiling.as_millis() as u64, "Dispatching command");

        let exec = self.runtime.exec(&id, &cmd, Some(&working_dir));
        let bounded_exec = tokio::time::timeout(ceiling, exec);
        let output = match self.step(cancel, deadline, bounded_exec).await? {
            Err(_elapsed) => {
                warn!(
                    container = %id,
                    timeout_ms = ceiling.as_millis() as u64,
                    "Command exceeded its CPU-time ceiling"
                );
                self.transition(LifecycleState::ResultCaptured).await;
                return Ok(ExecutionResult::timed_out(ceiling));
            }
            Ok(done) => done.map_err(SandboxError::Execution)?,
        };
        self.transition(LifecycleState::ResultCaptured).await;

        let result = ExecutionResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration: started.elapsed(),
        };
        info!(
            container = %id,
            exit_code = result.exit_code,
            duration_ms = result.duration.as_millis() as u64,
            "Command finished"
        );
        Ok(result)
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    async fn execute(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        {
            let mut state = self.state.lock().await;
            if state.claimed {
                return Err(SandboxError::Configuration(format!(
                    "sandbox already used (state: {}); create one sandbox per execution",
                    state.lifecycle
                )));
            }
            state.claimed = true;
        }

        let started = Instant::now();
        let mut workspace = None;

        let deadline =
            (!self.config.timeout.is_zero()).then(|| Deadline::now() + self.config.timeout);
        let outcome = self
            .provision_and_run(code, cancel, started, deadline, &mut workspace)
            .await;

        if let Err(e) = &outcome {
            warn!(language = %self.config.language, error = %e, "Sandbox execution failed");
            self.transition(LifecycleState::Failed(e.kind().to_string()))
                .await;
        }

        // A cancelled caller still gets its container removed.
        let teardown_token = if cancel.is_cancelled() {
            CancellationToken::new()
        } else {
            cancel.clone()
        };
        let teardown = self.cleanup(&teardown_token).await;

        if let Some(ws) = workspace.take() {
            if let Err(e) = ws.cleanup() {
                warn!(error = %e, "Failed to remove workspace");
            }
        }

        match (outcome, teardown) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(result), Err(e)) => {
                error!(error = %e, "Teardown failed after a successful run");
                Ok(result)
            }
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown_err)) => {
                error!(error = %teardown_err, "Teardown failed after an earlier error");
                Err(e)
            }
        }
    }

    async fn cleanup(&self, cancel: &CancellationToken) -> Result<(), SandboxError> {
        let mut state = self.state.lock().await;

        if state.cleaned {
            return Ok(());
        }
        let Some(id) = state.container_id.clone() else {
            return Ok(());
        };

        let runtime = Arc::clone(&self.runtime);
        let removal = self
            .config
            .retry
            .run(cancel, |attempt| {
                let runtime = Arc::clone(&runtime);
                let id = id.clone();
                async move {
                    debug!(container = %id, attempt, "Removing container");
                    runtime.remove_container(&id).await
                }
            })
            .await;

        match removal {
            Ok(()) => {
                state.container_id = None;
                state.cleaned = true;
                state.lifecycle = LifecycleState::Cleaned;
                info!(container = %id, "Container removed");
                Ok(())
            }
            Err(RetryError::Cancelled) => {
                warn!(container = %id, "Container removal cancelled");
                Err(SandboxError::Cancelled)
            }
            Err(source) => {
                error!(container = %id, error = %source, "Failed to remove container");
                Err(SandboxError::Teardown { id, source })
            }
        }
    }
}

/// Best-effort removal if the sandbox is dropped while still holding a container.
impl Drop for ContainerSandbox {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.cleaned {
            return;
        }
        let Some(id) = state.container_id.take() else {
            return;
        };

        warn!(container = %id, "Sandbox dropped before cleanup, removing container in background");
        let runtime = Arc::clone(&self.runtime);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = runtime.remove_container(&id).await {
                    warn!(container = %id, error = %e, "Background container removal failed");
                }
            });
        }
    }
}

/// Races `fut` against `cancel`; cancellation wins ties.
async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> Result<T, SandboxError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SandboxError::Cancelled),
        out = fut => Ok(out),
    }
}
