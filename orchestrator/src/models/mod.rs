//! Request and response types of the HTTP API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::results::{ResultType, StoredArtifact};
use crate::session::{FailureCause, SessionRecord, SessionState, SlotInfo};
use crate::sysdef::{SystemConfiguration, SystemRef};

// ============================================================================
// Session Models
// ============================================================================

/// Request to start a session
///
/// Either `system` or `syscfg.system` names the system. Without `syscfg` the
/// system's defaults are used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub system: Option<SystemRef>,

    #[serde(default)]
    pub syscfg: Option<SystemConfiguration>,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub creator: Option<String>,

    /// Run timeout; clamped to the configured maximum
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub system: SystemRef,
    pub state: SessionState,
    pub timeout_seconds: u64,
}

/// One line of a session listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub system: SystemRef,
    #[serde(default)]
    pub display_name: Option<String>,
    pub state: SessionState,
    /// Final state, also kept once the session is archived
    #[serde(default)]
    pub outcome: Option<SessionState>,
    #[serde(default)]
    pub cause: Option<FailureCause>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SessionSummary {
    /// Matches a state filter; archived sessions also match their outcome
    pub fn matches_state(&self, state: SessionState) -> bool {
        self.state == state || self.outcome == Some(state)
    }
}

impl From<&SessionRecord> for SessionSummary {
    fn from(record: &SessionRecord) -> Self {
        Self {
            session_id: record.id,
            system: record.system.clone(),
            display_name: record.details.display_name.clone(),
            state: record.state,
            outcome: record.outcome.as_ref().map(|o| o.state),
            cause: record.cause(),
            created_at: record.created_at,
            finished_at: record.finished_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListSessionsQuery {
    #[serde(default)]
    pub state: Option<SessionState>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub total: usize,
}

// ============================================================================
// Result Models
// ============================================================================

/// A declared result slot and what it currently holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultInfo {
    pub slot: String,
    pub result_type: ResultType,
    pub path: String,
    pub enabled: bool,
    pub required: bool,
    #[serde(default)]
    pub artifact: Option<StoredArtifact>,
}

impl ResultInfo {
    pub fn new(slot: &str, info: &SlotInfo, artifact: Option<StoredArtifact>) -> Self {
        Self {
            slot: slot.to_string(),
            result_type: info.result_type,
            path: info.path.clone(),
            enabled: info.enabled,
            required: info.required,
            artifact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsResponse {
    pub session_id: Uuid,
    pub results: Vec<ResultInfo>,
}

/// `?type=` on artifact upload and download
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultTypeQuery {
    #[serde(default, rename = "type")]
    pub result_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtfResponse {
    pub session_id: Uuid,
    pub slot: String,
    pub real_time_factor: f64,
}

// ============================================================================
// System Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEntry {
    pub name: String,
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemsResponse {
    pub systems: Vec<SystemEntry>,
}

// ============================================================================
// Service Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_sessions: u64,
    pub systems: u64,
    pub runtime: String,
    #[serde(default)]
    pub runtime_version: Option<String>,
}

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub name: String,
    pub version: String,
    pub sysdef_dataformat: String,
    pub syscfg_dataformat: String,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
    #[serde(default)]
    pub request_id: Option<Uuid>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
            request_id: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
