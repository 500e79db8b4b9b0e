//! Container runtime abstraction
//!
//! Handles all interactions with the container runtime on behalf of session
//! supervisors:
//! - Provisioning a container for a system image
//! - Starting it and streaming its output
//! - Waiting for exit, signalling and removing it
//! - Reading result files back from the bind-mounted workspace

mod docker;
mod podman;

#[cfg(test)]
pub(crate) mod fake;

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ContainerConfig, RuntimeKind};
use crate::sysdef::FileInput;

pub use docker::DockerDriver;
pub use podman::PodmanDriver;

/// File name of the staged configuration inside the workspace
pub const SYSCFG_FILE: &str = "syscfg.json";

/// Written into the workspace with the exit code when the build command fails
pub const BUILD_STATUS_FILE: &str = ".rtm-build-status";

/// Proxy variables forwarded from the host when enabled
pub const PROXY_ENV_VARS: [&str; 6] = [
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("image not available: {0}")]
    ImageNotFound(String),

    #[error("insufficient resources: {0}")]
    ResourceExhausted(String),

    #[error("container runtime unreachable: {0}")]
    Unavailable(String),

    #[error("no such container: {0}")]
    NotFound(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("workspace I/O failed: {0}")]
    Io(String),

    #[error("input file unavailable: {0}")]
    InputUnavailable(String),
}

/// Opaque reference to a provisioned container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub workspace: PathBuf,
}

/// How a container ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i64,
    #[serde(default)]
    pub oom_killed: bool,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0 && !self.oom_killed
    }
}

/// Everything a driver needs to create a session container
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub session_id: Uuid,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Host directory mounted at the container working directory
    pub workspace: PathBuf,
}

pub type OutputStream = BoxStream<'static, Result<Vec<u8>, DriverError>>;

/// Container runtime operations used by session supervisors
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Short runtime name for logs
    fn name(&self) -> &'static str;

    async fn runtime_version(&self) -> Result<String, DriverError>;

    /// Create (but do not start) a container, pulling its image if needed
    async fn provision(&self, spec: &ProvisionSpec) -> Result<ContainerHandle, DriverError>;

    async fn start(&self, handle: &ContainerHandle) -> Result<(), DriverError>;

    /// Resolve once the container has exited
    async fn await_exit(&self, handle: &ContainerHandle) -> Result<ExitStatus, DriverError>;

    /// Combined stdout/stderr; ends when the container exits
    async fn stream_output(&self, handle: &ContainerHandle) -> Result<OutputStream, DriverError>;

    /// Send SIGTERM, or SIGKILL when `force` is set
    async fn terminate(&self, handle: &ContainerHandle, force: bool) -> Result<(), DriverError>;

    /// Read a file relative to the container working directory
    async fn fetch_artifact(
        &self,
        handle: &ContainerHandle,
        path: &str,
    ) -> Result<Option<Vec<u8>>, DriverError>;

    /// Remove the container; succeeds if it is already gone
    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), DriverError>;
}

/// Connect the configured runtime
pub async fn connect(config: &ContainerConfig) -> Result<Arc<dyn ContainerDriver>> {
    let driver: Arc<dyn ContainerDriver> = match config.runtime {
        RuntimeKind::Docker => Arc::new(DockerDriver::connect(config).await?),
        RuntimeKind::Podman => Arc::new(PodmanDriver::connect(config).await?),
    };
    Ok(driver)
}

/// Container name for a session
pub fn container_name(session_id: &Uuid) -> String {
    format!("rtm_session_{}", session_id.simple())
}

/// Create the session workspace, download file inputs into it and write the
/// resolved configuration
pub async fn stage_workspace(
    workspace: &Path,
    syscfg_json: &[u8],
    inputs: &[FileInput],
    http: &reqwest::Client,
) -> Result<(), DriverError> {
    tokio::fs::create_dir_all(workspace)
        .await
        .map_err(|e| DriverError::Io(format!("create {}: {}", workspace.display(), e)))?;

    // Container users rarely match the host uid
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = std::fs::Permissions::from_mode(0o777);
        let _ = tokio::fs::set_permissions(workspace, permissions).await;
    }

    for input in inputs {
        fetch_input(workspace, input, http).await?;
    }

    tokio::fs::write(workspace.join(SYSCFG_FILE), syscfg_json)
        .await
        .map_err(|e| DriverError::Io(format!("write {}: {}", SYSCFG_FILE, e)))
}

async fn fetch_input(workspace: &Path, input: &FileInput, http: &reqwest::Client) -> Result<(), DriverError> {
    let unavailable = |e: reqwest::Error| {
        DriverError::InputUnavailable(format!("{} '{}': {}", input.group, input.name, e.without_url()))
    };

    let mut request = http.get(&input.source.url);
    if let Some(token) = &input.source.credentials {
        request = request.bearer_auth(token);
    }
    let content = request
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(unavailable)?
        .bytes()
        .await
        .map_err(unavailable)?;

    let target = workspace.join(&input.relative_path);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DriverError::Io(format!("create {}: {}", parent.display(), e)))?;
    }
    tokio::fs::write(&target, &content)
        .await
        .map_err(|e| DriverError::Io(format!("write {}: {}", input.relative_path, e)))?;

    tracing::debug!(parameter = %input.name, bytes = content.len(), "Fetched file input");
    Ok(())
}

/// Read `relative` below `workspace`; `None` if the file does not exist
pub async fn read_workspace_file(
    workspace: &Path,
    relative: &str,
) -> Result<Option<Vec<u8>>, DriverError> {
    let relative_path = Path::new(relative);
    if relative.is_empty()
        || relative_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(DriverError::Io(format!("invalid artifact path '{}'", relative)));
    }

    let resolved = match tokio::fs::canonicalize(workspace.join(relative_path)).await {
        Ok(resolved) => resolved,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DriverError::Io(e.to_string())),
    };
    let root = tokio::fs::canonicalize(workspace)
        .await
        .map_err(|e| DriverError::Io(e.to_string()))?;

    // Symlinks must not lead out of the workspace
    if !resolved.starts_with(&root) {
        return Err(DriverError::Io(format!("artifact path '{}' escapes the workspace", relative)));
    }

    match tokio::fs::read(&resolved).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DriverError::Io(e.to_string())),
    }
}

/// Host proxy settings to pass into containers
pub fn proxy_env() -> Vec<(String, String)> {
    PROXY_ENV_VARS
        .iter()
        .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
        .collect()
}

/// Classify a runtime error message
fn classify_message(message: &str) -> DriverError {
    let lower = message.to_lowercase();
    if lower.contains("no space left")
        || lower.contains("cannot allocate memory")
        || lower.contains("out of memory")
        || lower.contains("too many")
        || lower.contains("resource temporarily unavailable")
    {
        DriverError::ResourceExhausted(message.to_string())
    } else if lower.contains("no such container") || lower.contains("no container with") {
        DriverError::NotFound(message.to_string())
    } else if lower.contains("no such image") || lower.contains("image not known") {
        DriverError::ImageNotFound(message.to_string())
    } else {
        DriverError::Runtime(message.to_string())
    }
}
