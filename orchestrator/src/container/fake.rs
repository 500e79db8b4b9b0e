//! Scriptable in-memory driver for supervisor and manager tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{future, stream, StreamExt};
use tokio::sync::watch;

use super::{ContainerDriver, ContainerHandle, DriverError, ExitStatus, OutputStream, ProvisionSpec};

/// Exit code reported after SIGTERM
pub const SIGTERM_EXIT: i64 = 143;
/// Exit code reported after SIGKILL
pub const SIGKILL_EXIT: i64 = 137;

#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub provision_error: Option<DriverError>,
    pub provision_delay: Duration,
    pub start_error: Option<DriverError>,
    pub exit_code: i64,
    /// Exit on its own after this long; `None` runs until signalled
    pub run_time: Option<Duration>,
    pub output: Vec<Vec<u8>>,
    /// Files present in the workspace, by relative path
    pub artifacts: HashMap<String, Vec<u8>>,
    pub ignore_sigterm: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            provision_error: None,
            provision_delay: Duration::ZERO,
            start_error: None,
            exit_code: 0,
            run_time: Some(Duration::from_millis(20)),
            output: vec![b"booting\n".to_vec()],
            artifacts: HashMap::new(),
            ignore_sigterm: false,
        }
    }
}

struct FakeContainer {
    exit: Arc<watch::Sender<Option<i64>>>,
}

#[derive(Default)]
pub struct FakeDriver {
    behavior: FakeBehavior,
    containers: Mutex<HashMap<String, FakeContainer>>,
    specs: Mutex<Vec<ProvisionSpec>>,
    provisioned: AtomicUsize,
    destroyed: AtomicUsize,
    signals: Mutex<Vec<&'static str>>,
}

impl FakeDriver {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            ..Default::default()
        }
    }

    pub fn provisioned(&self) -> usize {
        self.provisioned.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Containers provisioned and not yet destroyed
    pub fn live_containers(&self) -> usize {
        self.containers.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn signals(&self) -> Vec<&'static str> {
        self.signals.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn specs(&self) -> Vec<ProvisionSpec> {
        self.specs.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn exit_sender(&self, handle: &ContainerHandle) -> Result<Arc<watch::Sender<Option<i64>>>, DriverError> {
        self.containers
            .lock()
            .map_err(|_| DriverError::Runtime("poisoned".into()))?
            .get(&handle.id)
            .map(|c| c.exit.clone())
            .ok_or_else(|| DriverError::NotFound(handle.id.clone()))
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn runtime_version(&self) -> Result<String, DriverError> {
        Ok("fake 1.0".into())
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<ContainerHandle, DriverError> {
        tokio::time::sleep(self.behavior.provision_delay).await;
        if let Some(error) = &self.behavior.provision_error {
            return Err(error.clone());
        }

        let id = format!("fake-{}", self.provisioned.fetch_add(1, Ordering::SeqCst));
        let (exit, _) = watch::channel(None);
        self.containers
            .lock()
            .map_err(|_| DriverError::Runtime("poisoned".into()))?
            .insert(id.clone(), FakeContainer { exit: Arc::new(exit) });
        if let Ok(mut specs) = self.specs.lock() {
            specs.push(spec.clone());
        }

        Ok(ContainerHandle {
            id,
            name: spec.name.clone(),
            workspace: spec.workspace.clone(),
        })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        if let Some(error) = &self.behavior.start_error {
            return Err(error.clone());
        }
        let exit = self.exit_sender(handle)?;
        if let Some(run_time) = self.behavior.run_time {
            let code = self.behavior.exit_code;
            tokio::spawn(async move {
                tokio::time::sleep(run_time).await;
                exit.send_if_modified(|status| {
                    if status.is_none() {
                        *status = Some(code);
                        true
                    } else {
                        false
                    }
                });
            });
        }
        Ok(())
    }

    async fn await_exit(&self, handle: &ContainerHandle) -> Result<ExitStatus, DriverError> {
        let mut rx = self.exit_sender(handle)?.subscribe();
        let code = *rx
            .wait_for(|status| status.is_some())
            .await
            .map_err(|_| DriverError::Runtime("container vanished".into()))?;
        Ok(ExitStatus {
            code: code.unwrap_or_default(),
            oom_killed: false,
        })
    }

    async fn stream_output(&self, handle: &ContainerHandle) -> Result<OutputStream, DriverError> {
        let mut rx = self.exit_sender(handle)?.subscribe();
        let chunks: Vec<Result<Vec<u8>, DriverError>> =
            self.behavior.output.iter().cloned().map(Ok).collect();
        let until_exit = stream::once(async move {
            let _ = rx.wait_for(|status| status.is_some()).await;
        })
        .filter_map(|()| future::ready(None));
        Ok(stream::iter(chunks).chain(until_exit).boxed())
    }

    async fn terminate(&self, handle: &ContainerHandle, force: bool) -> Result<(), DriverError> {
        let signal = if force { "SIGKILL" } else { "SIGTERM" };
        if let Ok(mut signals) = self.signals.lock() {
            signals.push(signal);
        }
        if !force && self.behavior.ignore_sigterm {
            return Ok(());
        }

        let code = if force { SIGKILL_EXIT } else { SIGTERM_EXIT };
        let exit = self.exit_sender(handle)?;
        exit.send_if_modified(|status| {
            if status.is_none() {
                *status = Some(code);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn fetch_artifact(
        &self,
        _handle: &ContainerHandle,
        path: &str,
    ) -> Result<Option<Vec<u8>>, DriverError> {
        Ok(self.behavior.artifacts.get(path).cloned())
    }

    async fn destroy(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        let removed = self
            .containers
            .lock()
            .map_err(|_| DriverError::Runtime("poisoned".into()))?
            .remove(&handle.id);
        if let Some(container) = removed {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            // wake waiters of a container removed while running
            container.exit.send_if_modified(|status| {
                if status.is_none() {
                    *status = Some(SIGKILL_EXIT);
                    true
                } else {
                    false
                }
            });
        }
        Ok(())
    }
}
