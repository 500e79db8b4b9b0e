//! Per-session result slots and artifact storage
//!
//! Artifacts land at `<root>/<session>/results/<slot>.<ext>`; the registry
//! keeps the declared slot types of every live session in memory. Which
//! slots hold an artifact is tracked by the session record.

use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::formats::{self, SimulationSpeed};
use super::{ResultArtifact, ResultError, ResultType, StoredArtifact};
use crate::sysdef::SystemDefinition;

pub struct ResultRegistry {
    root: PathBuf,
    sessions: RwLock<HashMap<Uuid, BTreeMap<String, ResultType>>>,
}

impl ResultRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Declare the slots of a new session
    pub async fn register(&self, session_id: Uuid, sysdef: &SystemDefinition) {
        let declared = sysdef
            .results
            .iter()
            .map(|(name, slot)| (name.clone(), slot.result_type))
            .collect();

        self.sessions.write().await.insert(session_id, declared);
    }

    /// Forget a session; stored files stay on disk
    pub async fn release(&self, session_id: &Uuid) {
        self.sessions.write().await.remove(session_id);
    }

    pub async fn is_registered(&self, session_id: &Uuid) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Validate and store an artifact, replacing any earlier one in the slot
    pub async fn ingest(
        &self,
        session_id: Uuid,
        slot: &str,
        artifact: ResultArtifact,
    ) -> Result<StoredArtifact, ResultError> {
        let declared = {
            let sessions = self.sessions.read().await;
            let declared = sessions
                .get(&session_id)
                .ok_or(ResultError::UnknownSession(session_id))?;
            *declared
                .get(slot)
                .ok_or_else(|| ResultError::UnknownSlot(slot.to_string()))?
        };

        let outcome = self.validate_and_store(session_id, slot, declared, artifact).await;
        match &outcome {
            Ok(stored) => {
                crate::metrics::record_artifact(declared.tag(), true, stored.size_bytes);
                tracing::info!(
                    session_id = %session_id,
                    slot = %slot,
                    result_type = %declared,
                    size_bytes = stored.size_bytes,
                    "Artifact stored"
                );
            }
            Err(e) => {
                crate::metrics::record_artifact(declared.tag(), false, 0);
                tracing::warn!(session_id = %session_id, slot = %slot, error = %e, "Artifact rejected");
            }
        }

        outcome
    }

    async fn validate_and_store(
        &self,
        session_id: Uuid,
        slot: &str,
        declared: ResultType,
        artifact: ResultArtifact,
    ) -> Result<StoredArtifact, ResultError> {
        let claimed = ResultType::from_tag(&artifact.tag).ok_or_else(|| ResultError::TypeMismatch {
            slot: slot.to_string(),
            expected: declared,
            reason: format!("unknown result type '{}'", artifact.tag),
        })?;
        if claimed != declared {
            return Err(ResultError::TypeMismatch {
                slot: slot.to_string(),
                expected: declared,
                reason: format!("artifact is tagged {}", claimed),
            });
        }

        let summary = formats::inspect(slot, declared, &artifact.content)?;

        let file_name = format!("{}.{}", slot, declared.extension());
        let mut components = Path::new(&file_name).components();
        if !matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(_)), None)
        ) || file_name.starts_with('.')
        {
            return Err(ResultError::UnknownSlot(slot.to_string()));
        }

        let dir = self.results_dir(&session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ResultError::Io(e.to_string()))?;

        let staging = dir.join(format!(".{}.partial", file_name));
        tokio::fs::write(&staging, &artifact.content)
            .await
            .map_err(|e| ResultError::Io(e.to_string()))?;
        tokio::fs::rename(&staging, dir.join(&file_name))
            .await
            .map_err(|e| ResultError::Io(e.to_string()))?;

        Ok(StoredArtifact {
            slot: slot.to_string(),
            result_type: declared,
            file_name,
            size_bytes: artifact.content.len() as u64,
            sha256: format!("{:x}", Sha256::digest(&artifact.content)),
            ingested_at: Utc::now(),
            summary,
        })
    }

    /// Read a stored artifact back from disk
    pub async fn read(&self, session_id: &Uuid, stored: &StoredArtifact) -> Result<Vec<u8>, ResultError> {
        tokio::fs::read(self.results_dir(session_id).join(&stored.file_name))
            .await
            .map_err(|e| ResultError::Io(e.to_string()))
    }

    /// Real-time factor of a stored `simulation_speed` artifact
    pub async fn real_time_factor(
        &self,
        session_id: &Uuid,
        stored: &StoredArtifact,
    ) -> Result<f64, ResultError> {
        if stored.result_type != ResultType::SimulationSpeed {
            return Err(ResultError::TypeMismatch {
                slot: stored.slot.clone(),
                expected: ResultType::SimulationSpeed,
                reason: format!("slot holds {}", stored.result_type),
            });
        }

        let content = self.read(session_id, stored).await?;
        let speed: SimulationSpeed =
            serde_json::from_slice(&content).map_err(|e| ResultError::SchemaViolation {
                slot: stored.slot.clone(),
                expected: ResultType::SimulationSpeed,
                reason: e.to_string(),
            })?;
        speed.real_time_factor()
    }

    fn results_dir(&self, session_id: &Uuid) -> PathBuf {
        session_results_dir(&self.root, session_id)
    }
}

pub(crate) fn session_results_dir(root: &Path, session_id: &Uuid) -> PathBuf {
    root.join(session_id.to_string()).join("results")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysdef::tests::sample_sysdef;
    use tempfile::TempDir;

    const PERF: &[u8] = br#"{"cycles": 4000, "instructions": 3000}"#;
    const SPEED: &[u8] = br#"{"simulated_time_sec": 0.0103042, "execution_time_sec": 0.154422}"#;

    async fn registry() -> (TempDir, ResultRegistry, Uuid) {
        let dir = TempDir::new().unwrap();
        let registry = ResultRegistry::new(dir.path());
        let id = Uuid::new_v4();
        registry.register(id, &sample_sysdef()).await;
        (dir, registry, id)
    }

    #[tokio::test]
    async fn test_ingest_stores_artifact() {
        let (dir, registry, id) = registry().await;

        let stored = registry
            .ingest(id, "perf", ResultArtifact::new(ResultType::Performance, PERF))
            .await
            .unwrap();
        assert_eq!(stored.file_name, "perf.json");
        assert_eq!(stored.size_bytes, PERF.len() as u64);
        assert_eq!(stored.sha256.len(), 64);
        assert!(dir.path().join(id.to_string()).join("results/perf.json").exists());

        assert_eq!(registry.read(&id, &stored).await.unwrap(), PERF);
    }

    #[tokio::test]
    async fn test_unknown_slot_and_session() {
        let (_dir, registry, id) = registry().await;

        let err = registry
            .ingest(id, "power", ResultArtifact::new(ResultType::Performance, PERF))
            .await
            .unwrap_err();
        assert_eq!(err, ResultError::UnknownSlot("power".into()));

        let other = Uuid::new_v4();
        let err = registry
            .ingest(other, "perf", ResultArtifact::new(ResultType::Performance, PERF))
            .await
            .unwrap_err();
        assert_eq!(err, ResultError::UnknownSession(other));
    }

    #[tokio::test]
    async fn test_type_mismatch_fails_closed() {
        let (dir, registry, id) = registry().await;

        let wrong = registry
            .ingest(id, "perf", ResultArtifact::new(ResultType::SimulationSpeed, SPEED))
            .await;
        assert!(matches!(wrong, Err(ResultError::TypeMismatch { .. })));

        let unknown = ResultArtifact {
            tag: "perfomance".into(),
            content: PERF.to_vec(),
        };
        assert!(matches!(
            registry.ingest(id, "perf", unknown).await,
            Err(ResultError::TypeMismatch { .. })
        ));
        assert!(!dir.path().join(id.to_string()).join("results/perf.json").exists());
    }

    #[tokio::test]
    async fn test_performance_missing_instructions() {
        let (_dir, registry, id) = registry().await;
        let err = registry
            .ingest(
                id,
                "perf",
                ResultArtifact::new(ResultType::Performance, &br#"{"cycles": 10}"#[..]),
            )
            .await;
        assert!(matches!(err, Err(ResultError::SchemaViolation { .. })));
    }

    #[tokio::test]
    async fn test_reingest_replaces_artifact() {
        let (_dir, registry, id) = registry().await;
        registry
            .ingest(id, "perf", ResultArtifact::new(ResultType::Performance, PERF))
            .await
            .unwrap();
        let replacement = br#"{"cycles": 1, "instructions": 1}"#;
        let stored = registry
            .ingest(id, "perf", ResultArtifact::new(ResultType::Performance, &replacement[..]))
            .await
            .unwrap();

        assert_eq!(stored.size_bytes, replacement.len() as u64);
        assert_eq!(registry.read(&id, &stored).await.unwrap(), replacement);
    }

    #[tokio::test]
    async fn test_real_time_factor_and_release() {
        let (_dir, registry, id) = registry().await;
        let speed = registry
            .ingest(id, "speed", ResultArtifact::new(ResultType::SimulationSpeed, SPEED))
            .await
            .unwrap();
        let perf = registry
            .ingest(id, "perf", ResultArtifact::new(ResultType::Performance, PERF))
            .await
            .unwrap();

        registry.release(&id).await;
        assert!(!registry.is_registered(&id).await);

        // files outlive the registration
        let rtf = registry.real_time_factor(&id, &speed).await.unwrap();
        assert!((rtf - 0.0667).abs() < 1e-4);
        assert!(matches!(
            registry.real_time_factor(&id, &perf).await,
            Err(ResultError::TypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_slot_name_cannot_leave_results_dir() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("sessions");
        let registry = ResultRegistry::new(&root);
        let id = Uuid::new_v4();

        // registered without validation, as a definition loaded by older code could be
        let mut sysdef = sample_sysdef();
        let slot = crate::sysdef::ResultSlot {
            result_type: ResultType::Text,
            path: "out/log.txt".into(),
            enabled_by: None,
            required: false,
            description: None,
        };
        sysdef.results.insert("/../../../escaped".into(), slot.clone());
        sysdef.results.insert("../escaped".into(), slot);
        registry.register(id, &sysdef).await;

        for name in ["/../../../escaped", "../escaped"] {
            let result = registry
                .ingest(id, name, ResultArtifact::new(ResultType::Text, &b"payload"[..]))
                .await;
            assert_eq!(result, Err(ResultError::UnknownSlot(name.into())));
        }
        assert!(!root.join(id.to_string()).join("escaped.txt").exists());
        assert!(!root.join("escaped.txt").exists());
        assert!(!dir.path().join("escaped.txt").exists());
    }
}
