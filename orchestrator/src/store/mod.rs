//! Durable session records
//!
//! One directory per session under the data directory:
//!
//! ```text
//! sessions/<id>/session.json   record, rewritten on every transition
//! sessions/<id>/workspace/     bind-mounted into the container
//! sessions/<id>/results/       ingested artifacts
//! ```
//!
//! Only a summary of each archived session stays in memory; the full record,
//! output included, is read back from disk on demand.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tokio::sync::RwLock;

use crate::container::ContainerHandle;
use crate::models::SessionSummary;
use crate::session::{FailureCause, SessionId, SessionRecord, SessionState};

const RECORD_FILE: &str = "session.json";

pub struct SessionRecordStore {
    root: PathBuf,
    archived: RwLock<HashMap<SessionId, SessionSummary>>,
    /// Containers of sessions interrupted by a restart, not yet reaped
    interrupted: Mutex<Vec<ContainerHandle>>,
}

impl SessionRecordStore {
    /// Open the store and recover every record found on disk
    pub async fn open(root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .context("Failed to create session storage directory")?;

        let store = Self {
            root: root.to_path_buf(),
            archived: RwLock::new(HashMap::new()),
            interrupted: Mutex::new(Vec::new()),
        };

        store.load_all().await?;

        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, id: &SessionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    pub fn workspace_dir(&self, id: &SessionId) -> PathBuf {
        self.session_dir(id).join("workspace")
    }

    /// Write a record through to disk, atomically replacing the previous copy
    pub async fn save(&self, record: &SessionRecord) -> Result<()> {
        let dir = self.session_dir(&record.id);
        let json = serde_json::to_vec_pretty(record).context("Failed to serialize session record")?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&dir).context("Failed to create session directory")?;
            let mut file = tempfile::NamedTempFile::new_in(&dir)
                .context("Failed to create temporary record file")?;
            file.write_all(&json).context("Failed to write session record")?;
            file.persist(dir.join(RECORD_FILE))
                .context("Failed to replace session record")?;
            Ok(())
        })
        .await
        .context("Record writer panicked")?
    }

    /// Persist an archived record and make it queryable
    pub async fn archive(&self, record: SessionRecord) -> Result<()> {
        if record.state != SessionState::Archived {
            anyhow::bail!("session {} is {}, not archived", record.id, record.state);
        }
        self.save(&record).await?;
        self.archived
            .write()
            .await
            .insert(record.id, SessionSummary::from(&record));
        Ok(())
    }

    /// Full archived record, read from disk
    pub async fn get(&self, id: &SessionId) -> Option<SessionRecord> {
        if !self.archived.read().await.contains_key(id) {
            return None;
        }

        let path = self.session_dir(id).join(RECORD_FILE);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Archived session record unreadable");
                return None;
            }
        };
        match serde_json::from_slice(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Archived session record corrupt");
                None
            }
        }
    }

    pub async fn summary(&self, id: &SessionId) -> Option<SessionSummary> {
        self.archived.read().await.get(id).cloned()
    }

    /// Summaries of archived sessions, newest first
    pub async fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self.archived.read().await.values().cloned().collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Containers left behind by sessions that were running at shutdown
    pub fn take_interrupted(&self) -> Vec<ContainerHandle> {
        self.interrupted
            .lock()
            .map(|mut handles| std::mem::take(&mut *handles))
            .unwrap_or_default()
    }

    /// Load all records from the storage directory
    async fn load_all(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        let mut loaded = 0;
        let mut recovered = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(RECORD_FILE);
            let Ok(content) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let mut record = match serde_json::from_str::<SessionRecord>(&content) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session record");
                    continue;
                }
            };

            if !record.state.is_terminal() {
                if let Some(container) = &record.container {
                    if let Ok(mut handles) = self.interrupted.lock() {
                        handles.push(ContainerHandle {
                            id: container.id.clone(),
                            name: container.name.clone(),
                            workspace: self.workspace_dir(&record.id),
                        });
                    }
                }
                // created records must pass through provisioning to fail
                if record.state == SessionState::Created {
                    record.transition(SessionState::Provisioning, None, None)?;
                }
                record.transition(
                    SessionState::Failed,
                    Some(FailureCause::RuntimeFailure),
                    Some("interrupted by a service restart".to_string()),
                )?;
                recovered += 1;
            }

            if record.state != SessionState::Archived {
                record.archive()?;
                self.save(&record).await?;
            }

            self.archived
                .write()
                .await
                .insert(record.id, SessionSummary::from(&record));
            loaded += 1;
        }

        tracing::info!(loaded = loaded, recovered = recovered, "Loaded session records");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::sample_record;
    use crate::session::ContainerInfo;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_archive() {
        let dir = TempDir::new().unwrap();
        let store = SessionRecordStore::open(dir.path()).await.unwrap();

        let mut record = sample_record();
        record.transition(SessionState::Provisioning, None, None).unwrap();
        store.save(&record).await.unwrap();
        assert!(dir.path().join(record.id.to_string()).join(RECORD_FILE).exists());

        // only archived records are queryable
        assert!(store.get(&record.id).await.is_none());
        assert!(store.archive(record.clone()).await.is_err());

        record
            .transition(SessionState::Failed, Some(FailureCause::ProvisioningError), None)
            .unwrap();
        record.archive().unwrap();
        store.archive(record.clone()).await.unwrap();
        assert_eq!(store.get(&record.id).await, Some(record));
    }

    #[tokio::test]
    async fn test_archived_output_stays_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = SessionRecordStore::open(dir.path()).await.unwrap();

        let mut record = sample_record();
        record.transition(SessionState::Provisioning, None, None).unwrap();
        record.transition(SessionState::Running, None, None).unwrap();
        let output = "x".repeat(256 * 1024);
        record.append_output(output.as_bytes(), 1024 * 1024);
        record.transition(SessionState::Succeeded, None, None).unwrap();
        record.archive().unwrap();
        store.archive(record.clone()).await.unwrap();

        let summary = store.summary(&record.id).await.unwrap();
        assert!(summary.matches_state(SessionState::Succeeded));
        assert_eq!(store.get(&record.id).await.unwrap().output, output);

        // the in-memory index cannot answer for the full record on its own
        tokio::fs::remove_file(dir.path().join(record.id.to_string()).join(RECORD_FILE))
            .await
            .unwrap();
        assert!(store.get(&record.id).await.is_none());
        assert_eq!(store.list().await, vec![summary]);
    }

    #[tokio::test]
    async fn test_restart_recovers_interrupted_sessions() {
        let dir = TempDir::new().unwrap();
        let store = SessionRecordStore::open(dir.path()).await.unwrap();

        let mut running = sample_record();
        running.transition(SessionState::Provisioning, None, None).unwrap();
        running.transition(SessionState::Running, None, None).unwrap();
        running.container = Some(ContainerInfo {
            id: "abc123".into(),
            name: "rtm_session_x".into(),
        });
        store.save(&running).await.unwrap();

        let mut done = sample_record();
        done.transition(SessionState::Provisioning, None, None).unwrap();
        done.transition(SessionState::Cancelled, None, None).unwrap();
        store.save(&done).await.unwrap();

        let reopened = SessionRecordStore::open(dir.path()).await.unwrap();
        let recovered = reopened.get(&running.id).await.unwrap();
        assert_eq!(recovered.state, SessionState::Archived);
        assert!(recovered.matches_state(SessionState::Failed));
        assert_eq!(recovered.cause(), Some(FailureCause::RuntimeFailure));

        let cancelled = reopened.get(&done.id).await.unwrap();
        assert!(cancelled.matches_state(SessionState::Cancelled));
        assert_eq!(reopened.list().await.len(), 2);

        let orphans = reopened.take_interrupted();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, "abc123");
        assert!(reopened.take_interrupted().is_empty());
    }
}
