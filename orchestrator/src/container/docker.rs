//! Docker Engine driver (via bollard)

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use tracing::{debug, info};

use super::{
    classify_message, read_workspace_file, ContainerDriver, ContainerHandle, DriverError, ExitStatus,
    OutputStream, ProvisionSpec,
};
use crate::config::ContainerConfig;

pub struct DockerDriver {
    docker: Docker,
    config: ContainerConfig,
}

impl DockerDriver {
    /// Connect to the daemon and verify it answers
    pub async fn connect(config: &ContainerConfig) -> Result<Self> {
        let docker = match &config.socket {
            Some(socket) => Docker::connect_with_socket(socket, 120, API_DEFAULT_VERSION)
                .with_context(|| format!("Failed to connect to Docker socket {}", socket))?,
            None => Docker::connect_with_local_defaults().context("Failed to connect to Docker")?,
        };

        let version = docker
            .version()
            .await
            .context("Docker daemon not available or not working")?;
        info!(docker_version = ?version.version, api_version = ?version.api_version, "Docker initialized");

        Ok(Self {
            docker,
            config: config.clone(),
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => return Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(e) => return Err(map_error(e)),
        }

        if !self.config.pull_images {
            return Err(DriverError::ImageNotFound(image.to_string()));
        }

        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            match item {
                Ok(_) => {}
                Err(BollardError::DockerResponseServerError { status_code, message })
                    if status_code == 404 || status_code == 403 =>
                {
                    return Err(DriverError::ImageNotFound(format!("{}: {}", image, message)));
                }
                Err(e) => return Err(map_error(e)),
            }
        }
        Ok(())
    }
}

fn map_error(error: BollardError) -> DriverError {
    match error {
        BollardError::DockerResponseServerError { status_code: 404, message } => {
            DriverError::NotFound(message)
        }
        BollardError::DockerResponseServerError { message, .. } => classify_message(&message),
        other => DriverError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn runtime_version(&self) -> Result<String, DriverError> {
        let version = self.docker.version().await.map_err(map_error)?;
        Ok(format!("Docker {}", version.version.unwrap_or_default()))
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ContainerHandle, DriverError> {
        self.ensure_image(&spec.image).await?;

        let limits = &self.config.limits;
        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                spec.workspace.display(),
                self.config.workdir
            )]),
            memory: Some((limits.max_memory_mb * 1024 * 1024) as i64),
            nano_cpus: Some((limits.max_cpus * 1_000_000_000.0) as i64),
            pids_limit: Some(limits.max_pids as i64),
            network_mode: (!self.config.network_enabled).then(|| "none".to_string()),
            ..Default::default()
        };

        let labels = HashMap::from([
            ("rtm.session".to_string(), spec.session_id.to_string()),
            ("rtm.managed".to_string(), "true".to_string()),
        ]);

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
            working_dir: Some(self.config.workdir.clone()),
            labels: Some(labels),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        debug!(session_id = %spec.session_id, image = %spec.image, "Creating container");
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(map_error)?;

        Ok(ContainerHandle {
            id: response.id,
            name: spec.name.clone(),
            workspace: spec.workspace.clone(),
        })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        self.docker
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(map_error)
    }

    async fn await_exit(&self, handle: &ContainerHandle) -> Result<ExitStatus, DriverError> {
        let mut wait = self
            .docker
            .wait_container(&handle.id, None::<WaitContainerOptions<String>>);

        let code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports non-zero exits as errors
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(map_error(e)),
            None => return Err(DriverError::Runtime("wait stream ended without status".into())),
        };

        let oom_killed = self
            .docker
            .inspect_container(&handle.id, None)
            .await
            .ok()
            .and_then(|info| info.state)
            .and_then(|state| state.oom_killed)
            .unwrap_or(false);

        Ok(ExitStatus { code, oom_killed })
    }

    async fn stream_output(&self, handle: &ContainerHandle) -> Result<OutputStream, DriverError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self
            .docker
            .logs(&handle.id, Some(options))
            .map(|item| {
                item.map(|output| output.into_bytes().to_vec())
                    .map_err(map_error)
            });
        Ok(stream.boxed())
    }

    async fn terminate(&self, handle: &ContainerHandle, force: bool) -> Result<(), DriverError> {
        let signal = if force { "SIGKILL" } else { "SIGTERM" };
        match self
            .docker
            .kill_container(&handle.id, Some(KillContainerOptions { signal }))
            .await
        {
            Ok(()) => Ok(()),
            // already stopped or gone
            Err(BollardError::DockerResponseServerError { status_code: 404 | 409, .. }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn fetch_artifact(
        &self,
        handle: &ContainerHandle,
        path: &str,
    ) -> Result<Option<Vec<u8>>, DriverError> {
        read_workspace_file(&handle.workspace, path).await
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&handle.id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }
}
