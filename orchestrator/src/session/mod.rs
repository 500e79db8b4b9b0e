//! Session lifecycle
//!
//! A session is one run of a system under a validated configuration. Its
//! record moves through
//! `created -> provisioning -> running -> (succeeded | failed | cancelled) -> archived`
//! and keeps an append-only log of every transition.

mod error;
mod manager;
mod supervisor;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::container::ExitStatus;
use crate::results::{ResultType, StoredArtifact};
use crate::sysdef::{ResolvedConfiguration, SystemConfiguration, SystemDefinition, SystemRef};

pub use error::SessionError;
pub use manager::{SessionFilter, SessionManager};
pub use supervisor::{CancelOutcome, SessionSupervisor, SupervisorContext, SupervisorHandle, SupervisorSettings};

pub type SessionId = Uuid;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Provisioning,
    Running,
    Succeeded,
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
    Archived,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Provisioning => "provisioning",
            SessionState::Running => "running",
            SessionState::Succeeded => "succeeded",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
            SessionState::Archived => "archived",
        }
    }

    /// Terminal states never return to a non-terminal one
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::Failed | SessionState::Cancelled | SessionState::Archived
        )
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Provisioning)
                | (Provisioning, Running | Failed | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
                | (Succeeded | Failed | Cancelled, Archived)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(SessionState::Created),
            "provisioning" => Ok(SessionState::Provisioning),
            "running" => Ok(SessionState::Running),
            "succeeded" => Ok(SessionState::Succeeded),
            "failed" => Ok(SessionState::Failed),
            "cancelled" | "canceled" => Ok(SessionState::Cancelled),
            "archived" => Ok(SessionState::Archived),
            other => Err(format!("unknown session state '{}'", other)),
        }
    }
}

/// Why a session ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureCause {
    ProvisioningError,
    RuntimeFailure,
    MissingResults,
    Timeout,
}

impl FailureCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCause::ProvisioningError => "ProvisioningError",
            FailureCause::RuntimeFailure => "RuntimeFailure",
            FailureCause::MissingResults => "MissingResults",
            FailureCause::Timeout => "Timeout",
        }
    }
}

/// One entry of the transition log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub at: DateTime<Utc>,
    pub from: Option<SessionState>,
    pub to: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Terminal state reached, kept after archiving
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Descriptive metadata supplied by the creator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
}

/// Timestamped note attached to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub producer: String,
    pub message: String,
}

/// A declared result slot as it applies to this session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub result_type: ResultType,
    pub path: String,
    /// Switched on by the configuration's `enabled_by` values
    pub enabled: bool,
    /// Must be filled for the run to succeed
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transition {from} -> {to} is not allowed")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Everything known about a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub system: SystemRef,
    #[serde(default)]
    pub details: SessionDetails,
    /// Resolved configuration, every parameter present
    pub syscfg: SystemConfiguration,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SessionOutcome>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived_at: Option<DateTime<Utc>>,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub container: Option<ContainerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitStatus>,
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    /// Tail of the container's combined output
    #[serde(default)]
    pub output: String,
    pub slots: BTreeMap<String, SlotInfo>,
    #[serde(default)]
    pub results: BTreeMap<String, StoredArtifact>,
}

impl SessionRecord {
    pub fn new(
        id: SessionId,
        sysdef: &SystemDefinition,
        resolved: &ResolvedConfiguration,
        details: SessionDetails,
        timeout_seconds: u64,
    ) -> Self {
        let slots = sysdef
            .results
            .iter()
            .map(|(name, slot)| {
                let enabled = sysdef.slot_enabled(name, resolved);
                let info = SlotInfo {
                    result_type: slot.result_type,
                    path: slot.path.clone(),
                    enabled,
                    required: enabled && slot.required,
                };
                (name.clone(), info)
            })
            .collect();

        let now = Utc::now();
        Self {
            id,
            system: resolved.system().clone(),
            details,
            syscfg: resolved.to_syscfg(),
            state: SessionState::Created,
            outcome: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            archived_at: None,
            timeout_seconds,
            container: None,
            exit: None,
            transitions: vec![Transition {
                at: now,
                from: None,
                to: SessionState::Created,
                cause: None,
                message: None,
            }],
            logs: Vec::new(),
            output: String::new(),
            slots,
            results: BTreeMap::new(),
        }
    }

    /// Move to `to`, appending to the transition log
    pub fn transition(
        &mut self,
        to: SessionState,
        cause: Option<FailureCause>,
        message: Option<String>,
    ) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition { from: self.state, to });
        }

        let now = Utc::now();
        match to {
            SessionState::Running => self.started_at = Some(now),
            SessionState::Succeeded | SessionState::Failed | SessionState::Cancelled => {
                self.finished_at = Some(now);
                self.outcome = Some(SessionOutcome {
                    state: to,
                    cause,
                    message: message.clone(),
                });
            }
            SessionState::Archived => self.archived_at = Some(now),
            SessionState::Created | SessionState::Provisioning => {}
        }

        self.transitions.push(Transition {
            at: now,
            from: Some(self.state),
            to,
            cause,
            message,
        });
        self.state = to;
        Ok(())
    }

    pub fn archive(&mut self) -> Result<(), InvalidTransition> {
        self.transition(SessionState::Archived, None, None)
    }

    pub fn log(&mut self, producer: &str, message: impl Into<String>) {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            producer: producer.to_string(),
            message: message.into(),
        });
    }

    /// Append container output, keeping at most `max_bytes` of the tail
    pub fn append_output(&mut self, chunk: &[u8], max_bytes: usize) {
        self.output.push_str(&String::from_utf8_lossy(chunk));
        if self.output.len() > max_bytes {
            let mut cut = self.output.len() - max_bytes;
            while !self.output.is_char_boundary(cut) {
                cut += 1;
            }
            self.output.drain(..cut);
        }
    }

    /// Required slots without an artifact
    pub fn missing_required(&self) -> Vec<String> {
        self.slots
            .iter()
            .filter(|(name, slot)| slot.required && !self.results.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Matches a state filter; archived records also match their outcome
    pub fn matches_state(&self, state: SessionState) -> bool {
        self.state == state || self.outcome.as_ref().map_or(false, |o| o.state == state)
    }

    pub fn cause(&self) -> Option<FailureCause> {
        self.outcome.as_ref().and_then(|o| o.cause)
    }
}
