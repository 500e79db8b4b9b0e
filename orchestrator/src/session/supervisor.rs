//! Per-session supervisor
//!
//! Each session is driven by one task that owns its record. Container work
//! runs on helper tasks which report back over a single event channel; API
//! callers talk to the task through a command channel and read its latest
//! published record from a watch channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::{ContainerInfo, FailureCause, SessionDetails, SessionError, SessionId, SessionRecord, SessionState};
use crate::config::AppConfig;
use crate::container::{
    container_name, proxy_env, stage_workspace, ContainerDriver, ContainerHandle, DriverError,
    ExitStatus, ProvisionSpec, BUILD_STATUS_FILE, SYSCFG_FILE,
};
use crate::results::{ResultArtifact, ResultRegistry, StoredArtifact};
use crate::store::SessionRecordStore;
use crate::sysdef::{FileInput, ResolvedConfiguration, SystemConfiguration, SystemDefinition};

/// Output still arriving after exit is collected for at most this long
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

/// Timing and container settings shared by all supervisors
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub provision_timeout: Duration,
    pub cancel_grace: Duration,
    pub max_output_bytes: usize,
    pub workdir: String,
    pub forward_proxy_env: bool,
    /// Fetches file parameters given by URL
    pub http: reqwest::Client,
}

impl SupervisorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let provision_timeout = config.sessions.provision_timeout();
        let http = reqwest::Client::builder()
            .timeout(provision_timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to a default HTTP client");
                reqwest::Client::new()
            });

        Self {
            provision_timeout,
            cancel_grace: config.sessions.cancel_grace(),
            max_output_bytes: config.sessions.max_output_bytes,
            workdir: config.container.workdir.clone(),
            forward_proxy_env: config.container.forward_proxy_env,
            http,
        }
    }
}

/// Collaborators every supervisor needs
#[derive(Clone)]
pub struct SupervisorContext {
    pub driver: Arc<dyn ContainerDriver>,
    pub registry: Arc<ResultRegistry>,
    pub store: Arc<SessionRecordStore>,
    pub settings: Arc<SupervisorSettings>,
}

enum Event {
    Started(Result<ContainerHandle, DriverError>),
    Output(Vec<u8>),
    OutputClosed,
    Exited(Result<ExitStatus, DriverError>),
}

enum Command {
    Cancel {
        reply: oneshot::Sender<CancelOutcome>,
    },
    Ingest {
        slot: String,
        artifact: ResultArtifact,
        reply: oneshot::Sender<Result<StoredArtifact, SessionError>>,
    },
}

/// Result of a cancel request
#[derive(Debug)]
pub enum CancelOutcome {
    Cancelled(SessionRecord),
    AlreadyTerminal(SessionState),
}

pub struct SessionSupervisor {
    record: SessionRecord,
    sysdef: Arc<SystemDefinition>,
    resolved: ResolvedConfiguration,
    inputs: Vec<FileInput>,
    ctx: SupervisorContext,
    status: watch::Sender<SessionRecord>,
}

impl SessionSupervisor {
    /// Validate `syscfg` and prepare a session in `provisioning`
    pub fn create(
        sysdef: Arc<SystemDefinition>,
        syscfg: &SystemConfiguration,
        details: SessionDetails,
        timeout_seconds: u64,
        ctx: SupervisorContext,
    ) -> Result<Self, SessionError> {
        let (resolved, inputs) = syscfg.validate(&sysdef)?.localize_files(&ctx.settings.workdir);

        let id = SessionId::new_v4();
        let mut record = SessionRecord::new(id, &sysdef, &resolved, details, timeout_seconds);
        record.log("supervisor", format!("session created for {}", sysdef.reference()));
        for input in &inputs {
            record.log(
                "supervisor",
                format!("{} '{}' will be fetched into {}", input.group, input.name, input.relative_path),
            );
        }
        record.transition(SessionState::Provisioning, None, None)?;

        let (status, _) = watch::channel(record.clone());
        Ok(Self {
            record,
            sysdef,
            resolved,
            inputs,
            ctx,
            status,
        })
    }

    pub fn id(&self) -> SessionId {
        self.record.id
    }

    pub fn snapshot(&self) -> SessionRecord {
        self.record.clone()
    }

    /// Start the supervisor task
    pub fn spawn(self) -> SupervisorHandle {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let handle = SupervisorHandle {
            id: self.record.id,
            status: self.status.subscribe(),
            commands: commands_tx,
        };

        let span = tracing::info_span!("session", session_id = %self.record.id);
        tokio::spawn(self.run(commands_rx).instrument(span));
        handle
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (events_tx, mut events) = mpsc::channel(64);
        let provisioning = CancellationToken::new();

        self.commit(true).await;
        self.start(events_tx.clone(), provisioning.clone());

        let mut container: Option<ContainerHandle> = None;
        let mut output_open = false;
        let mut deadline = Instant::now() + self.ctx.settings.provision_timeout;

        while !self.record.state.is_terminal() {
            tokio::select! {
                Some(event) = events.recv() => match event {
                    Event::Started(Ok(handle)) => {
                        self.on_started(&handle, &events_tx).await;
                        deadline = Instant::now() + Duration::from_secs(self.record.timeout_seconds);
                        output_open = true;
                        container = Some(handle);
                    }
                    Event::Started(Err(e)) => {
                        self.fail(FailureCause::ProvisioningError, e.to_string()).await;
                    }
                    Event::Output(chunk) => {
                        self.record.append_output(&chunk, self.ctx.settings.max_output_bytes);
                        self.commit(false).await;
                    }
                    Event::OutputClosed => output_open = false,
                    Event::Exited(result) => {
                        if let Some(handle) = container.take() {
                            self.on_exit(result, &handle, &mut events, output_open).await;
                        }
                    }
                },
                Some(command) = commands.recv() => match command {
                    Command::Cancel { reply } => {
                        match container.take() {
                            Some(handle) => self.stop(&handle, &mut events).await,
                            None => provisioning.cancel(),
                        }
                        self.transition(SessionState::Cancelled, None, Some("cancelled by request".into()))
                            .await;
                        let _ = reply.send(CancelOutcome::Cancelled(self.record.clone()));
                    }
                    Command::Ingest { slot, artifact, reply } => {
                        let result = self.ingest(&slot, artifact).await;
                        let _ = reply.send(result);
                    }
                },
                _ = sleep_until(deadline) => match container.take() {
                    Some(handle) => {
                        warn!(timeout_seconds = self.record.timeout_seconds, "Session timed out");
                        self.stop(&handle, &mut events).await;
                        let message = format!("exceeded run timeout of {}s", self.record.timeout_seconds);
                        self.fail(FailureCause::Timeout, message).await;
                    }
                    None => {
                        provisioning.cancel();
                        let message = format!(
                            "provisioning did not complete within {}s",
                            self.ctx.settings.provision_timeout.as_secs_f64()
                        );
                        self.fail(FailureCause::ProvisioningError, message).await;
                    }
                },
            }
        }

        // A container that came up after the session ended must not outlive it
        drop(events_tx);
        events.close();
        while let Some(event) = events.recv().await {
            if let Event::Started(Ok(handle)) = event {
                self.destroy(&handle).await;
            }
        }

        self.ctx.registry.release(&self.record.id).await;

        commands.close();
        while let Some(command) = commands.recv().await {
            self.refuse(command);
        }
    }

    /// Stage the workspace, then provision and start the container on a helper task
    fn start(&self, events: mpsc::Sender<Event>, token: CancellationToken) {
        let driver = self.ctx.driver.clone();
        let http = self.ctx.settings.http.clone();
        let inputs = self.inputs.clone();
        let spec = self.provision_spec();
        let syscfg_json = serde_json::to_vec_pretty(&self.record.syscfg);

        tokio::spawn(
            async move {
                let result = match syscfg_json {
                    Ok(json) => {
                        match stage_workspace(&spec.workspace, &json, &inputs, &http).await {
                            Ok(()) => provision_and_start(driver.as_ref(), &spec, &token).await,
                            Err(e) => Err(e),
                        }
                    }
                    Err(e) => Err(DriverError::Io(e.to_string())),
                };

                match result {
                    Ok(handle) if token.is_cancelled() => {
                        debug!(container = %handle.name, "Session ended during provisioning; removing container");
                        let _ = driver.destroy(&handle).await;
                    }
                    Ok(handle) => {
                        if let Err(mpsc::error::SendError(Event::Started(Ok(handle)))) =
                            events.send(Event::Started(Ok(handle))).await
                        {
                            let _ = driver.destroy(&handle).await;
                        }
                    }
                    Err(e) => {
                        let _ = events.send(Event::Started(Err(e))).await;
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn provision_spec(&self) -> ProvisionSpec {
        let id = self.record.id;
        let settings = &self.ctx.settings;
        let syscfg_path = format!("{}/{}", settings.workdir.trim_end_matches('/'), SYSCFG_FILE);

        let mut env = vec![
            ("RTM_SESSION_ID".to_string(), id.to_string()),
            ("RTM_SYSCFG".to_string(), syscfg_path.clone()),
        ];
        env.extend(self.resolved.env_vars());
        if settings.forward_proxy_env {
            env.extend(proxy_env());
        }

        let run = format!("{} {}", self.sysdef.run_command, syscfg_path);
        let script = match self.sysdef.build_step() {
            Some(build) => format!(
                "( {build} {cfg} ) || {{ status=$?; echo $status > {workdir}/{marker}; exit $status; }}; {run}",
                build = build,
                cfg = syscfg_path,
                workdir = settings.workdir.trim_end_matches('/'),
                marker = BUILD_STATUS_FILE,
                run = run,
            ),
            None => run,
        };

        ProvisionSpec {
            session_id: id,
            name: container_name(&id),
            image: self.sysdef.docker_image.clone(),
            command: vec!["/bin/sh".to_string(), "-c".to_string(), script],
            env,
            workspace: self.ctx.store.workspace_dir(&id),
        }
    }

    async fn on_started(&mut self, handle: &ContainerHandle, events: &mpsc::Sender<Event>) {
        self.record.container = Some(ContainerInfo {
            id: handle.id.clone(),
            name: handle.name.clone(),
        });
        self.transition(
            SessionState::Running,
            None,
            Some(format!("container {} started", handle.name)),
        )
        .await;

        let driver = self.ctx.driver.clone();
        let watched = handle.clone();
        let tx = events.clone();
        tokio::spawn(
            async move {
                let result = driver.await_exit(&watched).await;
                let _ = tx.send(Event::Exited(result)).await;
            }
            .in_current_span(),
        );

        let driver = self.ctx.driver.clone();
        let watched = handle.clone();
        let tx = events.clone();
        tokio::spawn(
            async move {
                match driver.stream_output(&watched).await {
                    Ok(mut output) => {
                        while let Some(chunk) = output.next().await {
                            match chunk {
                                Ok(bytes) => {
                                    if tx.send(Event::Output(bytes)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    debug!(error = %e, "Output stream failed");
                                    break;
                                }
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Container output unavailable"),
                }
                let _ = tx.send(Event::OutputClosed).await;
            }
            .in_current_span(),
        );
    }

    async fn on_exit(
        &mut self,
        result: Result<ExitStatus, DriverError>,
        handle: &ContainerHandle,
        events: &mut mpsc::Receiver<Event>,
        output_open: bool,
    ) {
        if output_open {
            self.drain_output(events).await;
        }

        let status = match result {
            Ok(status) => status,
            Err(e) => {
                self.destroy(handle).await;
                self.fail(FailureCause::RuntimeFailure, format!("lost track of the container: {}", e))
                    .await;
                return;
            }
        };
        self.record.exit = Some(status);

        if !status.success() {
            let build_failed = self.sysdef.build_step().is_some()
                && matches!(self.ctx.driver.fetch_artifact(handle, BUILD_STATUS_FILE).await, Ok(Some(_)));
            self.destroy(handle).await;

            let mut message = if build_failed {
                self.record
                    .log("container.build", format!("build command exited with code {}", status.code));
                format!("build command failed with exit code {}", status.code)
            } else {
                format!("container exited with code {}", status.code)
            };
            if status.oom_killed {
                message.push_str(" (out of memory)");
            }
            self.fail(FailureCause::RuntimeFailure, message).await;
            return;
        }

        self.collect_results(handle).await;
        self.destroy(handle).await;

        let missing = self.record.missing_required();
        if missing.is_empty() {
            self.transition(SessionState::Succeeded, None, Some("container exited cleanly".into()))
                .await;
        } else {
            let message = format!("missing required results: {}", missing.join(", "));
            self.fail(FailureCause::MissingResults, message).await;
        }
    }

    async fn drain_output(&mut self, events: &mut mpsc::Receiver<Event>) {
        let until = Instant::now() + OUTPUT_DRAIN;
        while let Ok(Some(event)) = timeout_at(until, events.recv()).await {
            match event {
                Event::Output(chunk) => {
                    self.record.append_output(&chunk, self.ctx.settings.max_output_bytes)
                }
                Event::OutputClosed => break,
                Event::Started(_) | Event::Exited(_) => {}
            }
        }
    }

    /// Ingest every enabled slot the run has not filled yet
    async fn collect_results(&mut self, handle: &ContainerHandle) {
        let pending: Vec<(String, crate::session::SlotInfo)> = self
            .record
            .slots
            .iter()
            .filter(|(name, slot)| slot.enabled && !self.record.results.contains_key(*name))
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();

        for (slot, info) in pending {
            let content = match self.ctx.driver.fetch_artifact(handle, &info.path).await {
                Ok(Some(content)) => content,
                Ok(None) => {
                    if info.required {
                        self.record
                            .log("supervisor", format!("required result '{}' not found at {}", slot, info.path));
                    }
                    continue;
                }
                Err(e) => {
                    self.record
                        .log("container", format!("failed to read result '{}': {}", slot, e));
                    continue;
                }
            };

            let artifact = ResultArtifact::new(info.result_type, content);
            match self.ctx.registry.ingest(self.record.id, &slot, artifact).await {
                Ok(stored) => {
                    self.record.results.insert(slot, stored);
                }
                Err(e) => {
                    self.record.log("result-registry", format!("rejected artifact: {}", e));
                }
            }
        }
    }

    async fn ingest(&mut self, slot: &str, artifact: ResultArtifact) -> Result<StoredArtifact, SessionError> {
        match self.ctx.registry.ingest(self.record.id, slot, artifact).await {
            Ok(stored) => {
                self.record.results.insert(slot.to_string(), stored.clone());
                self.commit(true).await;
                Ok(stored)
            }
            Err(e) => {
                self.record.log("result-registry", format!("rejected artifact: {}", e));
                self.commit(true).await;
                Err(e.into())
            }
        }
    }

    /// SIGTERM, then SIGKILL, each followed by a bounded wait for exit; then remove
    async fn stop(&mut self, handle: &ContainerHandle, events: &mut mpsc::Receiver<Event>) {
        let grace = self.ctx.settings.cancel_grace;

        for force in [false, true] {
            if let Err(e) = self.ctx.driver.terminate(handle, force).await {
                warn!(error = %e, force = force, "Failed to signal container");
            }
            if let Some(result) = self.wait_for_exit(events, grace).await {
                self.record.exit = result.ok();
                break;
            }
            let signal = if force { "SIGKILL" } else { "SIGTERM" };
            self.record.log(
                "supervisor",
                format!("container did not exit within {}s of {}", grace.as_secs_f64(), signal),
            );
        }

        self.destroy(handle).await;
    }

    async fn wait_for_exit(
        &mut self,
        events: &mut mpsc::Receiver<Event>,
        grace: Duration,
    ) -> Option<Result<ExitStatus, DriverError>> {
        let until = Instant::now() + grace;
        loop {
            match timeout_at(until, events.recv()).await {
                Ok(Some(Event::Exited(result))) => return Some(result),
                Ok(Some(Event::Output(chunk))) => {
                    self.record.append_output(&chunk, self.ctx.settings.max_output_bytes)
                }
                Ok(Some(Event::OutputClosed)) | Ok(Some(Event::Started(_))) => {}
                Ok(None) | Err(_) => return None,
            }
        }
    }

    async fn destroy(&self, handle: &ContainerHandle) {
        if let Err(e) = self.ctx.driver.destroy(handle).await {
            warn!(container = %handle.name, error = %e, "Failed to remove container");
        }
    }

    async fn fail(&mut self, cause: FailureCause, message: String) {
        self.transition(SessionState::Failed, Some(cause), Some(message)).await;
    }

    /// Append the transition, persist it, then publish it
    async fn transition(&mut self, to: SessionState, cause: Option<FailureCause>, message: Option<String>) {
        let from = self.record.state;
        if let Err(e) = self.record.transition(to, cause, message.clone()) {
            error!(error = %e, "Rejected state transition");
            return;
        }

        match cause {
            Some(cause) => warn!(from = %from, to = %to, cause = cause.as_str(), message = ?message, "Session transition"),
            None => info!(from = %from, to = %to, "Session transition"),
        }

        if to.is_terminal() {
            let duration = (Utc::now() - self.record.created_at).num_milliseconds() as f64 / 1000.0;
            crate::metrics::record_session_finished(
                &self.record.system.name,
                to.as_str(),
                cause.map(|c| c.as_str()),
                duration,
            );
        }

        self.commit(true).await;
    }

    async fn commit(&self, persist: bool) {
        if persist {
            if let Err(e) = self.ctx.store.save(&self.record).await {
                error!(error = %e, "Failed to persist session record");
            }
        }
        self.status.send_replace(self.record.clone());
    }

    fn refuse(&self, command: Command) {
        let state = self.record.state;
        match command {
            Command::Cancel { reply } => {
                let _ = reply.send(CancelOutcome::AlreadyTerminal(state));
            }
            Command::Ingest { reply, .. } => {
                let _ = reply.send(Err(SessionError::AlreadyTerminal {
                    id: self.record.id,
                    state,
                }));
            }
        }
    }
}

async fn provision_and_start(
    driver: &dyn ContainerDriver,
    spec: &ProvisionSpec,
    token: &CancellationToken,
) -> Result<ContainerHandle, DriverError> {
    let handle = driver.provision(spec).await?;
    if token.is_cancelled() {
        return Ok(handle);
    }

    if let Err(e) = driver.start(&handle).await {
        let _ = driver.destroy(&handle).await;
        return Err(e);
    }
    Ok(handle)
}

/// Caller side of a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    id: SessionId,
    status: watch::Receiver<SessionRecord>,
    commands: mpsc::Sender<Command>,
}

impl SupervisorHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Latest published record; never waits on container I/O
    pub fn poll(&self) -> SessionRecord {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn finished_at(&self) -> Option<chrono::DateTime<Utc>> {
        self.status.borrow().finished_at
    }

    pub async fn cancel(&self) -> CancelOutcome {
        let (reply, response) = oneshot::channel();
        if self.commands.send(Command::Cancel { reply }).await.is_err() {
            return CancelOutcome::AlreadyTerminal(self.state());
        }
        response
            .await
            .unwrap_or_else(|_| CancelOutcome::AlreadyTerminal(self.state()))
    }

    /// Push an artifact into a slot of a non-terminal session
    pub async fn ingest(&self, slot: &str, artifact: ResultArtifact) -> Result<StoredArtifact, SessionError> {
        let (reply, response) = oneshot::channel();
        let command = Command::Ingest {
            slot: slot.to_string(),
            artifact,
            reply,
        };
        let refused = || SessionError::AlreadyTerminal {
            id: self.id,
            state: self.state(),
        };

        if self.commands.send(command).await.is_err() {
            return Err(refused());
        }
        response.await.unwrap_or_else(|_| Err(refused()))
    }

    /// Resolve once the session has reached a terminal state
    pub async fn wait_terminal(&self) -> SessionRecord {
        let mut status = self.status.clone();
        let terminal = status
            .wait_for(|record| record.state.is_terminal())
            .await
            .map(|record| record.clone());
        terminal.unwrap_or_else(|_| self.poll())
    }
}
