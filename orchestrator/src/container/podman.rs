//! Podman driver (via the podman CLI)

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use tokio::process::Command;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use super::{
    classify_message, read_workspace_file, ContainerDriver, ContainerHandle, DriverError, ExitStatus,
    OutputStream, ProvisionSpec,
};
use crate::config::ContainerConfig;

pub struct PodmanDriver {
    podman_path: PathBuf,
    config: ContainerConfig,
}

impl PodmanDriver {
    /// Locate podman and verify it works
    pub async fn connect(config: &ContainerConfig) -> Result<Self> {
        let podman_path = match &config.podman_path {
            Some(path) => path.clone(),
            None => which::which("podman").unwrap_or_else(|_| PathBuf::from("/usr/bin/podman")),
        };

        let output = Command::new(&podman_path)
            .args(["--version"])
            .output()
            .await
            .context("Failed to run podman --version")?;

        if !output.status.success() {
            anyhow::bail!("Podman not available or not working");
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!(podman_version = %version.trim(), "Podman initialized");

        Ok(Self {
            podman_path,
            config: config.clone(),
        })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.podman_path);
        if let Some(socket) = &self.config.socket {
            cmd.arg("--url").arg(socket);
        }
        cmd
    }

    /// Run a podman subcommand and return its trimmed stdout
    async fn run<I, S>(&self, args: I) -> Result<String, DriverError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| DriverError::Unavailable(format!("failed to run podman: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_message(stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), DriverError> {
        let exists = self
            .command()
            .args(["image", "exists", image])
            .status()
            .await
            .map_err(|e| DriverError::Unavailable(e.to_string()))?;
        if exists.success() {
            return Ok(());
        }

        if !self.config.pull_images {
            return Err(DriverError::ImageNotFound(image.to_string()));
        }

        info!(image = %image, "Pulling image");
        match self.run(["pull", "--quiet", image]).await {
            Ok(_) => Ok(()),
            Err(DriverError::Runtime(message)) | Err(DriverError::NotFound(message)) => {
                Err(DriverError::ImageNotFound(format!("{}: {}", image, message)))
            }
            Err(e) => Err(e),
        }
    }

    fn create_args(&self, spec: &ProvisionSpec) -> Vec<String> {
        let limits = &self.config.limits;
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--label".to_string(),
            format!("rtm.session={}", spec.session_id),
            "--workdir".to_string(),
            self.config.workdir.clone(),
            // Workspace volume with UID mapping
            "--volume".to_string(),
            format!("{}:{}:rw,U", spec.workspace.display(), self.config.workdir),
            // Resource limits
            "--memory".to_string(),
            format!("{}m", limits.max_memory_mb),
            "--cpus".to_string(),
            format!("{}", limits.max_cpus),
            "--pids-limit".to_string(),
            format!("{}", limits.max_pids),
        ];

        if !self.config.network_enabled {
            args.push("--network".to_string());
            args.push("none".to_string());
        }

        for (key, value) in &spec.env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerDriver for PodmanDriver {
    fn name(&self) -> &'static str {
        "podman"
    }

    async fn runtime_version(&self) -> Result<String, DriverError> {
        self.run(["--version"]).await
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ContainerHandle, DriverError> {
        self.ensure_image(&spec.image).await?;

        let args = self.create_args(spec);
        debug!(args = ?args, "Creating container");
        let id = self.run(&args).await?;

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
            workspace: spec.workspace.clone(),
        })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        self.run(["start", handle.id.as_str()]).await.map(|_| ())
    }

    async fn await_exit(&self, handle: &ContainerHandle) -> Result<ExitStatus, DriverError> {
        let stdout = self.run(["wait", handle.id.as_str()]).await?;
        let code = stdout
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i64>().ok())
            .ok_or_else(|| DriverError::Runtime(format!("unexpected wait output '{}'", stdout)))?;

        let oom_killed = self
            .run(["inspect", "--format", "{{.State.OOMKilled}}", handle.id.as_str()])
            .await
            .map(|out| out == "true")
            .unwrap_or(false);

        Ok(ExitStatus { code, oom_killed })
    }

    async fn stream_output(&self, handle: &ContainerHandle) -> Result<OutputStream, DriverError> {
        let mut child = self
            .command()
            .args(["logs", "--follow", handle.id.as_str()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Unavailable(format!("failed to run podman logs: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Runtime("podman logs has no stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DriverError::Runtime("podman logs has no stderr".into()))?;

        let output = stream::select(ReaderStream::new(stdout), ReaderStream::new(stderr)).map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| DriverError::Io(e.to_string()))
        });

        // Keeps the child alive until both pipes close, then reaps it
        let reaper = stream::once(async move {
            let _ = child.wait().await;
        })
        .filter_map(|()| future::ready(None::<Result<Vec<u8>, DriverError>>));

        Ok(output.chain(reaper).boxed())
    }

    async fn terminate(&self, handle: &ContainerHandle, force: bool) -> Result<(), DriverError> {
        let signal = if force { "SIGKILL" } else { "SIGTERM" };
        match self.run(["kill", "--signal", signal, handle.id.as_str()]).await {
            Ok(_) | Err(DriverError::NotFound(_)) => Ok(()),
            Err(DriverError::Runtime(message)) if message.contains("not running") => Ok(()),
            Err(e) => Err(e),
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
        self.run(["rm", "--force", "--ignore", handle.id.as_str()])
            .await
            .map(|_| ())
    }
}
