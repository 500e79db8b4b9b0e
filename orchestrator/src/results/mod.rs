//! Result artifacts
//!
//! Typed outputs of a session run, validated against the result slots a
//! system definition declares.

mod formats;
mod registry;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use formats::{FunctionEntry, FunctionProfile, Performance, SimulationSpeed};
pub use registry::ResultRegistry;

/// Fixed enumeration of result types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    Binary,
    Text,
    Vcd,
    Fst,
    Performance,
    SimulationSpeed,
    JunitXml,
    Gprof,
    ProfileCsv,
}

impl ResultType {
    pub const ALL: [ResultType; 9] = [
        ResultType::Binary,
        ResultType::Text,
        ResultType::Vcd,
        ResultType::Fst,
        ResultType::Performance,
        ResultType::SimulationSpeed,
        ResultType::JunitXml,
        ResultType::Gprof,
        ResultType::ProfileCsv,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            ResultType::Binary => "binary",
            ResultType::Text => "text",
            ResultType::Vcd => "vcd",
            ResultType::Fst => "fst",
            ResultType::Performance => "performance",
            ResultType::SimulationSpeed => "simulation_speed",
            ResultType::JunitXml => "junit_xml",
            ResultType::Gprof => "gprof",
            ResultType::ProfileCsv => "profile_csv",
        }
    }

    /// Parse a type tag; unknown tags yield `None`
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    /// File extension used when storing an artifact of this type
    pub fn extension(&self) -> &'static str {
        match self {
            ResultType::Binary => "bin",
            ResultType::Text => "txt",
            ResultType::Vcd => "vcd",
            ResultType::Fst => "fst",
            ResultType::Performance | ResultType::SimulationSpeed => "json",
            ResultType::JunitXml => "xml",
            ResultType::Gprof => "gprof",
            ResultType::ProfileCsv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ResultType::Text | ResultType::Vcd | ResultType::Gprof => "text/plain; charset=utf-8",
            ResultType::Performance | ResultType::SimulationSpeed => "application/json",
            ResultType::JunitXml => "application/xml",
            ResultType::ProfileCsv => "text/csv",
            ResultType::Binary | ResultType::Fst => "application/octet-stream",
        }
    }
}

impl fmt::Display for ResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Payload emitted by a run, tagged with the type its producer claims
#[derive(Debug, Clone)]
pub struct ResultArtifact {
    pub tag: String,
    pub content: Vec<u8>,
}

impl ResultArtifact {
    pub fn new(result_type: ResultType, content: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: result_type.tag().to_string(),
            content: content.into(),
        }
    }
}

/// Parsed digest of a structured artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactSummary {
    Performance {
        cycles: u64,
        instructions: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        frequency_hz: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        instructions_per_cycle: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_time_sec: Option<f64>,
    },
    SimulationSpeed {
        simulated_time_sec: f64,
        execution_time_sec: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        real_time_factor: Option<f64>,
    },
    FunctionProfile {
        functions: usize,
        total_self_cycles: u64,
    },
}

/// Reference to an artifact stored for a session slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub slot: String,
    pub result_type: ResultType,
    pub file_name: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub ingested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ArtifactSummary>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResultError {
    #[error("session {0} has no registered result slots")]
    UnknownSession(Uuid),

    #[error("result slot '{0}' is not declared")]
    UnknownSlot(String),

    #[error("artifact for slot '{slot}' does not match declared type {expected}: {reason}")]
    TypeMismatch {
        slot: String,
        expected: ResultType,
        reason: String,
    },

    #[error("artifact for slot '{slot}' violates the {expected} schema: {reason}")]
    SchemaViolation {
        slot: String,
        expected: ResultType,
        reason: String,
    },

    #[error("real-time factor is undefined for a zero execution time")]
    DivisionUndefined,

    #[error("result slot '{0}' has not been filled")]
    NotAvailable(String),

    #[error("artifact storage failed: {0}")]
    Io(String),
}

impl ResultError {
    /// Taxonomy name used at the API boundary
    pub fn kind(&self) -> &'static str {
        match self {
            ResultError::UnknownSession(_) => "NotFound",
            ResultError::UnknownSlot(_) => "UnknownSlot",
            ResultError::TypeMismatch { .. } => "TypeMismatch",
            ResultError::SchemaViolation { .. } => "SchemaViolation",
            ResultError::DivisionUndefined => "DivisionUndefined",
            ResultError::NotAvailable(_) => "NotFound",
            ResultError::Io(_) => "InternalError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip_and_fail_closed() {
        for result_type in ResultType::ALL {
            assert_eq!(ResultType::from_tag(result_type.tag()), Some(result_type));
            let json = serde_json::to_string(&result_type).unwrap();
            assert_eq!(json, format!("\"{}\"", result_type.tag()));
        }
        assert_eq!(ResultType::from_tag("PERFORMANCE"), None);
        assert_eq!(ResultType::from_tag("pdf"), None);
    }
}
