//! Session admission, lookup and retention

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::{
    CancelOutcome, SessionDetails, SessionError, SessionId, SessionRecord, SessionState, SessionSupervisor,
    SupervisorContext, SupervisorHandle, SupervisorSettings,
};
use crate::config::{AppConfig, SessionConfig};
use crate::container::ContainerDriver;
use crate::models::{CreateSessionRequest, ListSessionsQuery, ResultInfo, SessionSummary};
use crate::results::{ResultArtifact, ResultError, ResultRegistry, ResultType, StoredArtifact};
use crate::store::SessionRecordStore;
use crate::sysdef::{SystemCatalog, SystemConfiguration};

/// Listing filter; every given bound must match
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub state: Option<SessionState>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl SessionFilter {
    fn matches(&self, summary: &SessionSummary) -> bool {
        self.state.map_or(true, |state| summary.matches_state(state))
            && self.since.map_or(true, |since| summary.created_at >= since)
            && self.until.map_or(true, |until| summary.created_at <= until)
    }
}

impl From<ListSessionsQuery> for SessionFilter {
    fn from(query: ListSessionsQuery) -> Self {
        Self {
            state: query.state,
            since: query.since,
            until: query.until,
        }
    }
}

/// Owns the live session set
pub struct SessionManager {
    config: SessionConfig,
    stop_on_shutdown: bool,
    catalog: Arc<SystemCatalog>,
    ctx: SupervisorContext,
    live: RwLock<HashMap<SessionId, SupervisorHandle>>,
}

impl SessionManager {
    pub fn new(
        config: &AppConfig,
        catalog: Arc<SystemCatalog>,
        driver: Arc<dyn ContainerDriver>,
        store: Arc<SessionRecordStore>,
    ) -> Self {
        let ctx = SupervisorContext {
            driver,
            registry: Arc::new(ResultRegistry::new(store.root())),
            store,
            settings: Arc::new(SupervisorSettings::from_config(config)),
        };

        Self {
            config: config.sessions.clone(),
            stop_on_shutdown: config.container.stop_containers_on_shutdown,
            catalog,
            ctx,
            live: RwLock::new(HashMap::new()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn ContainerDriver> {
        &self.ctx.driver
    }

    /// Remove containers left behind by sessions interrupted by a restart
    pub async fn reap_interrupted(&self) -> usize {
        let mut reaped = 0;
        for handle in self.ctx.store.take_interrupted() {
            match self.ctx.driver.destroy(&handle).await {
                Ok(()) => reaped += 1,
                Err(e) => warn!(container = %handle.name, error = %e, "Failed to remove orphaned container"),
            }
        }
        if reaped > 0 {
            info!(count = reaped, "Removed containers of interrupted sessions");
        }
        reaped
    }

    /// Validate, admit and start a session
    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionRecord, SessionError> {
        let system = request
            .system
            .clone()
            .or_else(|| request.syscfg.as_ref().map(|syscfg| syscfg.system.clone()))
            .ok_or_else(|| SessionError::ConfigurationInvalid("no system was named".into()))?;

        let Some(sysdef) = self.catalog.get(&system).await else {
            crate::metrics::record_admission_rejected("configuration");
            return Err(SessionError::ConfigurationInvalid(format!("unknown system {}", system)));
        };

        let syscfg = request
            .syscfg
            .unwrap_or_else(|| SystemConfiguration::from_sysdef(&sysdef));
        let details = SessionDetails {
            display_name: request.display_name,
            description: request.description,
            creator: request.creator,
        };
        let timeout = self.config.effective_timeout(request.timeout_seconds);

        let supervisor = SessionSupervisor::create(sysdef.clone(), &syscfg, details, timeout, self.ctx.clone())
            .map_err(|e| {
                crate::metrics::record_admission_rejected("configuration");
                e
            })?;

        // counting and inserting under one write lock keeps admission exact
        let mut live = self.live.write().await;
        let active = live.values().filter(|h| !h.state().is_terminal()).count();
        if active >= self.config.max_active_sessions {
            crate::metrics::record_admission_rejected("capacity");
            warn!(active = active, limit = self.config.max_active_sessions, "Session rejected: at capacity");
            return Err(SessionError::CapacityExceeded {
                limit: self.config.max_active_sessions,
            });
        }

        self.ctx.registry.register(supervisor.id(), &sysdef).await;
        let record = supervisor.snapshot();
        live.insert(record.id, supervisor.spawn());
        drop(live);

        crate::metrics::record_session_created(&system.name);
        info!(
            session_id = %record.id,
            system = %system,
            timeout_seconds = timeout,
            "Session created"
        );

        Ok(record)
    }

    async fn live_handle(&self, id: &SessionId) -> Option<SupervisorHandle> {
        self.live.read().await.get(id).cloned()
    }

    pub async fn get_session(&self, id: &SessionId) -> Result<SessionRecord, SessionError> {
        if let Some(handle) = self.live_handle(id).await {
            return Ok(handle.poll());
        }
        self.ctx
            .store
            .get(id)
            .await
            .ok_or(SessionError::NotFound(*id))
    }

    /// Live and archived sessions, newest first
    pub async fn list_sessions(&self, filter: &SessionFilter) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .live
            .read()
            .await
            .values()
            .map(|h| SessionSummary::from(&h.poll()))
            .collect();
        let live_ids: HashSet<SessionId> = summaries.iter().map(|s| s.session_id).collect();

        summaries.extend(
            self.ctx
                .store
                .list()
                .await
                .into_iter()
                .filter(|s| !live_ids.contains(&s.session_id)),
        );
        summaries.retain(|s| filter.matches(s));
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    pub async fn cancel_session(&self, id: &SessionId) -> Result<SessionRecord, SessionError> {
        let Some(handle) = self.live_handle(id).await else {
            return Err(self.not_live(id).await);
        };

        match handle.cancel().await {
            CancelOutcome::Cancelled(record) => {
                info!(session_id = %id, "Session cancelled");
                Ok(record)
            }
            CancelOutcome::AlreadyTerminal(state) => Err(SessionError::AlreadyTerminal { id: *id, state }),
        }
    }

    /// Push an artifact into a running session's slot
    pub async fn ingest_artifact(
        &self,
        id: &SessionId,
        slot: &str,
        artifact: ResultArtifact,
    ) -> Result<StoredArtifact, SessionError> {
        match self.live_handle(id).await {
            Some(handle) => handle.ingest(slot, artifact).await,
            None => Err(self.not_live(id).await),
        }
    }

    /// Every declared slot and its artifact, if any
    pub async fn result_infos(&self, id: &SessionId) -> Result<Vec<ResultInfo>, SessionError> {
        let record = self.get_session(id).await?;
        Ok(record
            .slots
            .iter()
            .map(|(slot, info)| ResultInfo::new(slot, info, record.results.get(slot).cloned()))
            .collect())
    }

    /// Stored artifact of a slot and its content
    pub async fn result_content(
        &self,
        id: &SessionId,
        slot: &str,
        expected: Option<ResultType>,
    ) -> Result<(StoredArtifact, Vec<u8>), SessionError> {
        let stored = self.stored_artifact(id, slot).await?;
        if let Some(expected) = expected {
            if expected != stored.result_type {
                return Err(ResultError::TypeMismatch {
                    slot: slot.to_string(),
                    expected,
                    reason: format!("slot holds {}", stored.result_type),
                }
                .into());
            }
        }

        let content = self.ctx.registry.read(id, &stored).await?;
        Ok((stored, content))
    }

    pub async fn real_time_factor(&self, id: &SessionId, slot: &str) -> Result<f64, SessionError> {
        let stored = self.stored_artifact(id, slot).await?;
        Ok(self.ctx.registry.real_time_factor(id, &stored).await?)
    }

    async fn stored_artifact(&self, id: &SessionId, slot: &str) -> Result<StoredArtifact, SessionError> {
        let record = self.get_session(id).await?;
        if !record.slots.contains_key(slot) {
            return Err(ResultError::UnknownSlot(slot.to_string()).into());
        }
        record
            .results
            .get(slot)
            .cloned()
            .ok_or_else(|| ResultError::NotAvailable(slot.to_string()).into())
    }

    /// Archive terminal sessions past their retention period
    pub async fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let retention = self.config.retention();
        let expired: Vec<SupervisorHandle> = self
            .live
            .read()
            .await
            .values()
            .filter(|h| h.state().is_terminal())
            .filter(|h| {
                h.finished_at()
                    .and_then(|at| (now - at).to_std().ok())
                    .map_or(false, |age| age >= retention)
            })
            .cloned()
            .collect();

        let mut evicted = 0;
        for handle in expired {
            let mut record = handle.poll();
            if let Err(e) = record.archive() {
                warn!(session_id = %record.id, error = %e, "Cannot archive session");
                continue;
            }
            if let Err(e) = self.ctx.store.archive(record).await {
                error!(session_id = %handle.id(), error = %e, "Failed to archive session");
                continue;
            }
            self.live.write().await.remove(&handle.id());
            evicted += 1;
        }

        if evicted > 0 {
            info!(count = evicted, "Archived expired sessions");
        }
        evicted
    }

    /// Sessions not yet in a terminal state
    pub async fn active_session_count(&self) -> usize {
        self.live
            .read()
            .await
            .values()
            .filter(|h| !h.state().is_terminal())
            .count()
    }

    /// Cancel active sessions if configured to do so
    pub async fn shutdown(&self) {
        let active: Vec<SupervisorHandle> = self
            .live
            .read()
            .await
            .values()
            .filter(|h| !h.state().is_terminal())
            .cloned()
            .collect();

        if active.is_empty() {
            return;
        }
        if !self.stop_on_shutdown {
            info!(count = active.len(), "Leaving active sessions running");
            return;
        }

        info!(count = active.len(), "Cancelling active sessions");
        futures::future::join_all(active.iter().map(|h| h.cancel())).await;
    }

    async fn not_live(&self, id: &SessionId) -> SessionError {
        match self.ctx.store.summary(id).await {
            Some(summary) => SessionError::AlreadyTerminal {
                id: *id,
                state: summary.state,
            },
            None => SessionError::NotFound(*id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::fake::{FakeBehavior, FakeDriver};
    use crate::sysdef::tests::sample_sysdef;
    use crate::sysdef::SystemRef;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap as Map;
    use std::time::Duration;
    use tempfile::TempDir;

    const PERF: &[u8] = br#"{"cycles": 4000, "instructions": 3000, "frequency_hz": 1000000}"#;
    const SPEED: &[u8] = br#"{"simulated_time_sec": 0.0103042, "execution_time_sec": 0.154422}"#;

    struct Fixture {
        _dir: TempDir,
        driver: Arc<FakeDriver>,
        manager: SessionManager,
    }

    async fn fixture(behavior: FakeBehavior, configure: impl FnOnce(&mut AppConfig)) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };
        config.sessions.cancel_grace_seconds = 1;
        configure(&mut config);

        let catalog = Arc::new(SystemCatalog::empty(dir.path()));
        catalog.insert(sample_sysdef()).await.unwrap();
        let store = Arc::new(SessionRecordStore::open(&config.sessions_dir()).await.unwrap());
        let driver = Arc::new(FakeDriver::new(behavior));
        let manager = SessionManager::new(&config, catalog, driver.clone(), store);

        Fixture {
            _dir: dir,
            driver,
            manager,
        }
    }

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            system: Some(SystemRef::new("riscv-vp", "1.2")),
            display_name: Some("smoke".into()),
            ..CreateSessionRequest::default()
        }
    }

    fn artifacts() -> Map<String, Vec<u8>> {
        Map::from([
            ("out/perf.json".to_string(), PERF.to_vec()),
            ("out/speed.json".to_string(), SPEED.to_vec()),
        ])
    }

    async fn wait_terminal(manager: &SessionManager, id: &SessionId) -> SessionRecord {
        let handle = manager.live_handle(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_terminal())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_complete() {
        let f = fixture(
            FakeBehavior {
                artifacts: artifacts(),
                ..FakeBehavior::default()
            },
            |_| {},
        )
        .await;

        let record = f.manager.create_session(request()).await.unwrap();
        assert_eq!(record.state, SessionState::Provisioning);
        assert_eq!(record.details.display_name.as_deref(), Some("smoke"));
        assert_eq!(record.timeout_seconds, 3600);

        let done = wait_terminal(&f.manager, &record.id).await;
        assert_eq!(done.state, SessionState::Succeeded);

        let infos = f.manager.result_infos(&record.id).await.unwrap();
        let perf = infos.iter().find(|i| i.slot == "perf").unwrap();
        assert!(perf.artifact.is_some());
        let waveform = infos.iter().find(|i| i.slot == "waveform").unwrap();
        assert!(!waveform.enabled);

        let (stored, content) = f.manager.result_content(&record.id, "perf", None).await.unwrap();
        assert_eq!(stored.result_type, ResultType::Performance);
        assert_eq!(content, PERF);

        let rtf = f.manager.real_time_factor(&record.id, "speed").await.unwrap();
        assert!((rtf - 0.0667).abs() < 1e-3, "{}", rtf);
    }

    #[tokio::test]
    async fn test_result_lookup_errors() {
        let f = fixture(
            FakeBehavior {
                artifacts: artifacts(),
                ..FakeBehavior::default()
            },
            |_| {},
        )
        .await;
        let id = f.manager.create_session(request()).await.unwrap().id;
        wait_terminal(&f.manager, &id).await;

        let unknown = f.manager.result_content(&id, "power", None).await.unwrap_err();
        assert_eq!(unknown.kind(), "UnknownSlot");

        let empty = f.manager.result_content(&id, "hotspots", None).await.unwrap_err();
        assert_eq!(empty.kind(), "NotFound");

        let wrong = f
            .manager
            .result_content(&id, "perf", Some(ResultType::Vcd))
            .await
            .unwrap_err();
        assert_eq!(wrong.kind(), "TypeMismatch");

        let rtf = f.manager.real_time_factor(&id, "perf").await.unwrap_err();
        assert_eq!(rtf.kind(), "TypeMismatch");
    }

    #[tokio::test]
    async fn test_unknown_system_is_rejected() {
        let f = fixture(FakeBehavior::default(), |_| {}).await;
        let result = f
            .manager
            .create_session(CreateSessionRequest {
                system: Some(SystemRef::new("riscv-vp", "9.9")),
                ..CreateSessionRequest::default()
            })
            .await;
        assert!(matches!(result, Err(SessionError::ConfigurationInvalid(_))));

        let result = f.manager.create_session(CreateSessionRequest::default()).await;
        assert!(matches!(result, Err(SessionError::ConfigurationInvalid(_))));
        assert_eq!(f.driver.provisioned(), 0);
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let f = fixture(
            FakeBehavior {
                run_time: None,
                ..FakeBehavior::default()
            },
            |config| config.sessions.max_active_sessions = 1,
        )
        .await;

        let first = f.manager.create_session(request()).await.unwrap();
        let second = f.manager.create_session(request()).await;
        assert!(matches!(second, Err(SessionError::CapacityExceeded { limit: 1 })));
        assert_eq!(f.manager.active_session_count().await, 1);

        // a terminal session frees its slot
        f.manager.cancel_session(&first.id).await.unwrap();
        assert_eq!(f.manager.active_session_count().await, 0);
        assert!(f.manager.create_session(request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_errors() {
        let f = fixture(
            FakeBehavior {
                run_time: None,
                ..FakeBehavior::default()
            },
            |_| {},
        )
        .await;

        let missing = f.manager.cancel_session(&SessionId::new_v4()).await;
        assert!(matches!(missing, Err(SessionError::NotFound(_))));

        let id = f.manager.create_session(request()).await.unwrap().id;
        let cancelled = f.manager.cancel_session(&id).await.unwrap();
        assert_eq!(cancelled.state, SessionState::Cancelled);

        let again = f.manager.cancel_session(&id).await;
        assert!(matches!(
            again,
            Err(SessionError::AlreadyTerminal {
                state: SessionState::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_eviction_archives_terminal_sessions() {
        let f = fixture(
            FakeBehavior {
                run_time: None,
                ..FakeBehavior::default()
            },
            |config| config.sessions.retention_seconds = 0,
        )
        .await;

        let done = f.manager.create_session(request()).await.unwrap().id;
        let running = f.manager.create_session(request()).await.unwrap().id;
        f.manager.cancel_session(&done).await.unwrap();

        assert_eq!(f.manager.evict_expired().await, 1);
        assert!(f.manager.live_handle(&done).await.is_none());
        assert!(f.manager.live_handle(&running).await.is_some());

        // still queryable after eviction
        let archived = f.manager.get_session(&done).await.unwrap();
        assert_eq!(archived.state, SessionState::Archived);
        assert!(archived.matches_state(SessionState::Cancelled));
        assert!(matches!(
            f.manager.cancel_session(&done).await,
            Err(SessionError::AlreadyTerminal { .. })
        ));

        f.manager.shutdown().await;
        assert_eq!(f.manager.active_session_count().await, 0);
        assert_eq!(f.driver.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_reap_interrupted_containers() {
        use crate::container::MockContainerDriver;
        use crate::session::tests::sample_record;
        use crate::session::ContainerInfo;

        let dir = TempDir::new().unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            ..AppConfig::default()
        };

        let mut running = sample_record();
        running.transition(SessionState::Provisioning, None, None).unwrap();
        running.transition(SessionState::Running, None, None).unwrap();
        running.container = Some(ContainerInfo {
            id: "c0ffee".into(),
            name: "rtm_session_c0ffee".into(),
        });
        SessionRecordStore::open(&config.sessions_dir())
            .await
            .unwrap()
            .save(&running)
            .await
            .unwrap();

        let mut driver = MockContainerDriver::new();
        driver
            .expect_destroy()
            .withf(|handle| handle.id == "c0ffee")
            .times(1)
            .returning(|_| Ok(()));

        let store = Arc::new(SessionRecordStore::open(&config.sessions_dir()).await.unwrap());
        let catalog = Arc::new(SystemCatalog::empty(dir.path()));
        let manager = SessionManager::new(&config, catalog, Arc::new(driver), store);

        assert_eq!(manager.reap_interrupted().await, 1);
        assert_eq!(manager.reap_interrupted().await, 0);

        let recovered = manager.get_session(&running.id).await.unwrap();
        assert_eq!(recovered.cause(), Some(crate::session::FailureCause::RuntimeFailure));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let f = fixture(
            FakeBehavior {
                run_time: None,
                ..FakeBehavior::default()
            },
            |_| {},
        )
        .await;

        let first = f.manager.create_session(request()).await.unwrap();
        let second = f.manager.create_session(request()).await.unwrap();
        f.manager.cancel_session(&first.id).await.unwrap();

        let all = f.manager.list_sessions(&SessionFilter::default()).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].session_id, second.id);

        let cancelled = f
            .manager
            .list_sessions(&SessionFilter {
                state: Some(SessionState::Cancelled),
                ..SessionFilter::default()
            })
            .await;
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].session_id, first.id);

        let later = f
            .manager
            .list_sessions(&SessionFilter {
                since: Some(second.created_at),
                ..SessionFilter::default()
            })
            .await;
        assert_eq!(later.len(), 1);

        let none = f
            .manager
            .list_sessions(&SessionFilter {
                until: Some(first.created_at - chrono::Duration::seconds(1)),
                ..SessionFilter::default()
            })
            .await;
        assert!(none.is_empty());
    }
}
