use thiserror::Error;

use super::{InvalidTransition, SessionId, SessionState};
use crate::results::ResultError;
use crate::sysdef::ConfigError;

/// Errors returned by session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("active session limit of {limit} reached")]
    CapacityExceeded { limit: usize },

    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {id} is already {state}")]
    AlreadyTerminal { id: SessionId, state: SessionState },

    #[error(transparent)]
    Result(#[from] ResultError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("session storage failed: {0}")]
    Storage(String),
}

impl From<ConfigError> for SessionError {
    fn from(error: ConfigError) -> Self {
        SessionError::ConfigurationInvalid(error.to_string())
    }
}

impl SessionError {
    /// Taxonomy name used at the API boundary
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::ConfigurationInvalid(_) => "ConfigurationInvalid",
            SessionError::CapacityExceeded { .. } => "CapacityExceeded",
            SessionError::NotFound(_) => "NotFound",
            SessionError::AlreadyTerminal { .. } => "AlreadyTerminal",
            SessionError::Result(e) => e.kind(),
            SessionError::Transition(_) | SessionError::Storage(_) => "InternalError",
        }
    }
}
