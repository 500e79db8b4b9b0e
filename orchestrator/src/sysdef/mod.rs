//! System Definitions (SysDef) and System Configurations (SysCfg)
//!
//! A SysDef declares the parameters a simulated system exposes and the result
//! slots a run is expected to fill. A SysCfg assigns concrete values to those
//! parameters and is validated against its SysDef exactly once, when a
//! session is admitted.

mod catalog;
mod config;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::results::ResultType;

pub use catalog::{CatalogError, SystemCatalog};
pub use config::{ConfigError, FileInput, ResolvedConfiguration, SystemConfiguration, SystemRef};

/// Data format identifier written into SysDef documents
pub const SYSDEF_DATAFORMAT: &str = "sysdef:0.4";

/// Data format identifier written into SysCfg documents
pub const SYSCFG_DATAFORMAT: &str = "syscfg:0.3";

static PARAMETER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").expect("parameter name pattern"));

// ============================================================================
// Parameters
// ============================================================================

/// Parameter groups shared by SysDef and SysCfg documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterGroup {
    Common,
    Build,
    Run,
}

impl ParameterGroup {
    pub const ALL: [ParameterGroup; 3] = [
        ParameterGroup::Common,
        ParameterGroup::Build,
        ParameterGroup::Run,
    ];

    /// Document key of the group, e.g. `run_parameters`
    pub fn key(&self) -> &'static str {
        match self {
            ParameterGroup::Common => "common_parameters",
            ParameterGroup::Build => "build_parameters",
            ParameterGroup::Run => "run_parameters",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|group| group.key() == key)
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            ParameterGroup::Common => "COMMON",
            ParameterGroup::Build => "BUILD",
            ParameterGroup::Run => "RUN",
        }
    }
}

impl fmt::Display for ParameterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A concrete parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// File fetched into the workspace before the container starts
    Url(FileReference),
}

/// Remote file given for a file parameter
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReference {
    pub url: String,
    /// Sent as a bearer token when fetching
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<String>,
}

impl fmt::Debug for FileReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReference")
            .field("url", &self.url)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl FileReference {
    fn check(&self) -> Result<(), String> {
        let lower = self.url.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Ok(())
        } else {
            Err(format!("'{}' is not an http(s) URL", self.url))
        }
    }
}

/// Kind of a parameter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Integer,
    Float,
    String,
    Url,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Url => "file reference",
        };
        f.write_str(name)
    }
}

impl ParameterValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ParameterValue::Bool(_) => ValueKind::Bool,
            ParameterValue::Integer(_) => ValueKind::Integer,
            ParameterValue::Float(_) => ValueKind::Float,
            ParameterValue::String(_) => ValueKind::String,
            ParameterValue::Url(_) => ValueKind::Url,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Integer(value) => Some(*value as f64),
            ParameterValue::Float(value) => Some(*value),
            _ => None,
        }
    }

    /// Equality that treats integer and float values numerically
    fn matches(&self, other: &ParameterValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(value) => write!(f, "{}", value),
            ParameterValue::Integer(value) => write!(f, "{}", value),
            ParameterValue::Float(value) => write!(f, "{}", value),
            ParameterValue::String(value) => f.write_str(value),
            ParameterValue::Url(reference) => f.write_str(&reference.url),
        }
    }
}

/// Constraint attached to a detailed parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterMeta {
    Enum { values: Vec<ParameterValue> },
    Range { lower: f64, upper: f64 },
    File {
        #[serde(default = "default_true")]
        is_file: bool,
    },
}

/// Parameter with a default and optional constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedParameter {
    pub default_value: ParameterValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ParameterMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Parameter declaration: either a bare default value or a detailed spec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterSpec {
    Detailed(DetailedParameter),
    Plain(ParameterValue),
}

/// Why a value was refused by a parameter declaration
#[derive(Debug, Clone, PartialEq)]
pub enum ValueRejection {
    Kind { expected: ValueKind, found: ValueKind },
    Constraint(String),
}

impl ParameterSpec {
    pub fn default_value(&self) -> &ParameterValue {
        match self {
            ParameterSpec::Detailed(detail) => &detail.default_value,
            ParameterSpec::Plain(value) => value,
        }
    }

    pub fn meta(&self) -> Option<&ParameterMeta> {
        match self {
            ParameterSpec::Detailed(detail) => detail.meta.as_ref(),
            ParameterSpec::Plain(_) => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.meta(), Some(ParameterMeta::File { is_file: true }))
    }

    /// Declared kind, fixed by the default value
    pub fn kind(&self) -> ValueKind {
        if self.is_file() {
            ValueKind::String
        } else {
            self.default_value().kind()
        }
    }

    /// Check a candidate value and return it normalized to the declared kind
    pub fn check(&self, value: &ParameterValue) -> Result<ParameterValue, ValueRejection> {
        let expected = self.kind();
        let normalized = match (expected, value) {
            (ValueKind::Float, ParameterValue::Integer(number)) => {
                ParameterValue::Float(*number as f64)
            }
            (ValueKind::String, ParameterValue::Url(reference)) if self.is_file() => {
                reference.check().map_err(ValueRejection::Constraint)?;
                value.clone()
            }
            _ if value.kind() == expected => value.clone(),
            _ => {
                return Err(ValueRejection::Kind {
                    expected,
                    found: value.kind(),
                })
            }
        };

        match self.meta() {
            Some(ParameterMeta::Enum { values }) => {
                if !values.iter().any(|allowed| allowed.matches(&normalized)) {
                    let allowed: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                    return Err(ValueRejection::Constraint(format!(
                        "'{}' is not one of [{}]",
                        normalized,
                        allowed.join(", ")
                    )));
                }
            }
            Some(ParameterMeta::Range { lower, upper }) => {
                let number = normalized.as_f64().ok_or_else(|| {
                    ValueRejection::Constraint("range constraint requires a number".into())
                })?;
                if number < *lower || number > *upper {
                    return Err(ValueRejection::Constraint(format!(
                        "{} is outside [{}, {}]",
                        number, lower, upper
                    )));
                }
            }
            Some(ParameterMeta::File { .. }) | None => {}
        }

        Ok(normalized)
    }

    fn validate_default(&self) -> Result<(), String> {
        if let ParameterValue::Url(reference) = self.default_value() {
            if !self.is_file() {
                return Err("file reference default on a parameter without is_file".into());
            }
            reference.check()?;
        }
        let ParameterSpec::Detailed(detail) = self else {
            return Ok(());
        };
        let default = &detail.default_value;

        match &detail.meta {
            Some(ParameterMeta::Enum { values }) => {
                let first = values.first().ok_or("enum constraint has no values")?;
                if values.iter().any(|v| v.kind() != first.kind()) {
                    return Err("enum values must share one type".into());
                }
                if default.kind() != first.kind() {
                    return Err(format!(
                        "default of enum parameter has type {} but values are {}",
                        default.kind(),
                        first.kind()
                    ));
                }
                if !values.contains(default) {
                    return Err(format!("default '{}' is not an allowed enum value", default));
                }
            }
            Some(ParameterMeta::Range { lower, upper }) => {
                if lower > upper {
                    return Err(format!("range lower bound {} exceeds upper bound {}", lower, upper));
                }
                let number = default
                    .as_f64()
                    .ok_or_else(|| format!("default of range parameter has type {}", default.kind()))?;
                if number < *lower || number > *upper {
                    return Err(format!("default {} is outside [{}, {}]", number, lower, upper));
                }
            }
            Some(ParameterMeta::File { .. }) => {
                if !matches!(default.kind(), ValueKind::String | ValueKind::Url) {
                    return Err(format!("default of file parameter '{}' is not a string", default));
                }
            }
            None => {}
        }
        Ok(())
    }
}

// ============================================================================
// Result slots
// ============================================================================

/// A named, typed output the system promises to produce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultSlot {
    #[serde(rename = "type")]
    pub result_type: ResultType,

    /// Location of the artifact, relative to the container working directory
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_by: Option<Vec<String>>,

    #[serde(default = "default_true")]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Target of an `enabled_by` pointer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnablerRef {
    Parameter(ParameterGroup, String),
    Result(String),
}

impl EnablerRef {
    /// Parse a pointer of the form `#/<group>/<name>`
    pub fn parse(pointer: &str) -> Option<Self> {
        let path = pointer.strip_prefix("#/")?;
        let (group, name) = path.split_once('/')?;
        if name.is_empty() || name.contains('/') {
            return None;
        }
        if group == "results" {
            return Some(EnablerRef::Result(name.to_string()));
        }
        ParameterGroup::from_key(group).map(|group| EnablerRef::Parameter(group, name.to_string()))
    }
}

// ============================================================================
// System definition
// ============================================================================

/// Free-form documentation of a system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Documentation {
    pub contact: String,
    pub summary: String,
    pub description: String,
}

/// SysDef document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemDefinition {
    #[serde(default = "default_sysdef_dataformat")]
    pub dataformat: String,

    pub name: String,

    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<Documentation>,

    /// Container image the system runs in
    pub docker_image: String,

    /// Command executed in the container; the SysCfg path is appended
    pub run_command: String,

    /// Run before `run_command` in the same container, with the SysCfg path appended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,

    #[serde(default)]
    pub common_parameters: BTreeMap<String, ParameterSpec>,

    #[serde(default)]
    pub build_parameters: BTreeMap<String, ParameterSpec>,

    #[serde(default)]
    pub run_parameters: BTreeMap<String, ParameterSpec>,

    #[serde(default)]
    pub results: BTreeMap<String, ResultSlot>,
}

/// Reasons a SysDef is refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("field '{0}' must not be empty")]
    MissingField(&'static str),

    #[error("invalid parameter name '{name}' in {group}")]
    InvalidParameterName { group: ParameterGroup, name: String },

    #[error("invalid default for parameter '{name}' in {group}: {reason}")]
    InvalidDefault {
        group: ParameterGroup,
        name: String,
        reason: String,
    },

    #[error("invalid result slot name '{0}'")]
    InvalidSlotName(String),

    #[error("result '{slot}' has an invalid path '{path}'")]
    InvalidSlotPath { slot: String, path: String },

    #[error("result '{slot}' has a malformed enabled_by pointer '{pointer}'")]
    InvalidPointer { slot: String, pointer: String },

    #[error("result '{slot}' is enabled by '{pointer}', which does not exist")]
    UnresolvedReference { slot: String, pointer: String },

    #[error("result '{slot}' is enabled by non-boolean parameter '{pointer}'")]
    NonBooleanEnabler { slot: String, pointer: String },

    #[error("cyclic enabled_by chain: {}", .0.join(" -> "))]
    CyclicEnabledBy(Vec<String>),
}

impl SystemDefinition {
    pub fn reference(&self) -> SystemRef {
        SystemRef {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    pub fn parameters(&self, group: ParameterGroup) -> &BTreeMap<String, ParameterSpec> {
        match group {
            ParameterGroup::Common => &self.common_parameters,
            ParameterGroup::Build => &self.build_parameters,
            ParameterGroup::Run => &self.run_parameters,
        }
    }

    pub fn parameter(&self, group: ParameterGroup, name: &str) -> Option<&ParameterSpec> {
        self.parameters(group).get(name)
    }

    /// Build command, if one is declared and not blank
    pub fn build_step(&self) -> Option<&str> {
        self.build_command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
    }

    pub fn slot(&self, name: &str) -> Option<&ResultSlot> {
        self.results.get(name)
    }

    /// Validate the document as a whole
    pub fn validate(&self) -> Result<(), DefinitionError> {
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("docker_image", &self.docker_image),
            ("run_command", &self.run_command),
        ] {
            if value.trim().is_empty() {
                return Err(DefinitionError::MissingField(field));
            }
        }

        for group in ParameterGroup::ALL {
            for (name, spec) in self.parameters(group) {
                if !PARAMETER_NAME.is_match(name) {
                    return Err(DefinitionError::InvalidParameterName {
                        group,
                        name: name.clone(),
                    });
                }
                spec.validate_default()
                    .map_err(|reason| DefinitionError::InvalidDefault {
                        group,
                        name: name.clone(),
                        reason,
                    })?;
            }
        }

        for (slot_name, slot) in &self.results {
            // slot names become file names below the results directory
            if !PARAMETER_NAME.is_match(slot_name) {
                return Err(DefinitionError::InvalidSlotName(slot_name.clone()));
            }
            let path = std::path::Path::new(&slot.path);
            if slot.path.trim().is_empty()
                || path.is_absolute()
                || path.components().any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(DefinitionError::InvalidSlotPath {
                    slot: slot_name.clone(),
                    path: slot.path.clone(),
                });
            }
            for pointer in slot.enabled_by.iter().flatten() {
                self.check_enabler(slot_name, pointer)?;
            }
        }

        self.check_enabler_cycles()
    }

    fn check_enabler(&self, slot: &str, pointer: &str) -> Result<(), DefinitionError> {
        let target = EnablerRef::parse(pointer).ok_or_else(|| DefinitionError::InvalidPointer {
            slot: slot.to_string(),
            pointer: pointer.to_string(),
        })?;

        match target {
            EnablerRef::Parameter(group, name) => {
                let spec = self.parameter(group, &name).ok_or_else(|| {
                    DefinitionError::UnresolvedReference {
                        slot: slot.to_string(),
                        pointer: pointer.to_string(),
                    }
                })?;
                if spec.kind() != ValueKind::Bool {
                    return Err(DefinitionError::NonBooleanEnabler {
                        slot: slot.to_string(),
                        pointer: pointer.to_string(),
                    });
                }
            }
            EnablerRef::Result(name) => {
                if !self.results.contains_key(&name) {
                    return Err(DefinitionError::UnresolvedReference {
                        slot: slot.to_string(),
                        pointer: pointer.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn result_enablers<'a>(&'a self, slot: &'a ResultSlot) -> impl Iterator<Item = String> + 'a {
        slot.enabled_by
            .iter()
            .flatten()
            .filter_map(|pointer| match EnablerRef::parse(pointer) {
                Some(EnablerRef::Result(name)) => Some(name),
                _ => None,
            })
    }

    /// Depth-first search for a back edge between result slots
    fn check_enabler_cycles(&self) -> Result<(), DefinitionError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit(
            def: &SystemDefinition,
            slot: &str,
            marks: &mut BTreeMap<String, Mark>,
            stack: &mut Vec<String>,
        ) -> Result<(), DefinitionError> {
            marks.insert(slot.to_string(), Mark::InProgress);
            stack.push(slot.to_string());

            if let Some(result) = def.results.get(slot) {
                for next in def.result_enablers(result) {
                    match marks.get(&next).copied().unwrap_or(Mark::Unvisited) {
                        Mark::InProgress => {
                            let start = stack.iter().position(|s| *s == next).unwrap_or(0);
                            let mut cycle = stack[start..].to_vec();
                            cycle.push(next);
                            return Err(DefinitionError::CyclicEnabledBy(cycle));
                        }
                        Mark::Unvisited => visit(def, &next, marks, stack)?,
                        Mark::Done => {}
                    }
                }
            }

            stack.pop();
            marks.insert(slot.to_string(), Mark::Done);
            Ok(())
        }

        let mut marks: BTreeMap<String, Mark> = BTreeMap::new();
        for slot in self.results.keys() {
            if marks.get(slot).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                visit(self, slot, &mut marks, &mut Vec::new())?;
            }
        }
        Ok(())
    }

    /// Whether a slot is switched on under the given configuration.
    ///
    /// Requires a validated definition: enabler chains are acyclic.
    pub fn slot_enabled(&self, slot: &str, config: &ResolvedConfiguration) -> bool {
        let Some(result) = self.results.get(slot) else {
            return false;
        };
        result.enabled_by.iter().flatten().all(|pointer| {
            match EnablerRef::parse(pointer) {
                Some(EnablerRef::Parameter(group, name)) => config
                    .get(group, &name)
                    .and_then(ParameterValue::as_bool)
                    .unwrap_or(false),
                Some(EnablerRef::Result(name)) => self.slot_enabled(&name, config),
                None => false,
            }
        })
    }

    /// Slots that must be filled for a run under `config` to succeed
    pub fn required_slots(&self, config: &ResolvedConfiguration) -> BTreeSet<String> {
        self.results
            .iter()
            .filter(|(name, slot)| slot.required && self.slot_enabled(name, config))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_sysdef_dataformat() -> String {
    SYSDEF_DATAFORMAT.to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small but complete SysDef used across the crate's tests
    pub(crate) fn sample_sysdef() -> SystemDefinition {
        serde_json::from_value(serde_json::json!({
            "name": "riscv-vp",
            "version": "1.2",
            "docker_image": "registry.example.com/riscv-vp:1.2",
            "run_command": "/opt/vp/run.sh",
            "common_parameters": {
                "core_count": { "default_value": 1, "meta": { "lower": 1, "upper": 8 } }
            },
            "build_parameters": {
                "debug": false
            },
            "run_parameters": {
                "firmware": { "default_value": "fw.elf", "meta": { "is_file": true } },
                "clock_mhz": { "default_value": 100.0, "meta": { "lower": 1.0, "upper": 1000.0 } },
                "isa": { "default_value": "rv32imc", "meta": { "values": ["rv32imc", "rv64gc"] } },
                "trace": false,
                "profile": true
            },
            "results": {
                "perf": { "type": "performance", "path": "out/perf.json" },
                "speed": { "type": "simulation_speed", "path": "out/speed.json" },
                "waveform": {
                    "type": "vcd",
                    "path": "out/trace.vcd",
                    "enabled_by": ["#/run_parameters/trace"]
                },
                "hotspots": {
                    "type": "profile_csv",
                    "path": "out/profile.csv",
                    "enabled_by": ["#/run_parameters/profile"],
                    "required": false
                }
            }
        }))
        .expect("sample sysdef")
    }

    #[test]
    fn test_sample_sysdef_is_valid() {
        let sysdef = sample_sysdef();
        assert!(sysdef.validate().is_ok());
        assert_eq!(sysdef.dataformat, SYSDEF_DATAFORMAT);
        assert!(matches!(
            sysdef.parameter(ParameterGroup::Build, "debug"),
            Some(ParameterSpec::Plain(ParameterValue::Bool(false)))
        ));
        assert!(sysdef.parameter(ParameterGroup::Run, "firmware").unwrap().is_file());
    }

    #[test]
    fn test_cyclic_enabled_by_is_rejected() {
        let mut sysdef = sample_sysdef();
        sysdef.results.get_mut("perf").unwrap().enabled_by = Some(vec!["#/results/speed".into()]);
        sysdef.results.get_mut("speed").unwrap().enabled_by = Some(vec!["#/results/perf".into()]);

        match sysdef.validate() {
            Err(DefinitionError::CyclicEnabledBy(cycle)) => {
                assert_eq!(cycle, vec!["perf", "speed", "perf"]);
            }
            other => panic!("expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_self_enabling_slot_is_a_cycle() {
        let mut sysdef = sample_sysdef();
        sysdef.results.get_mut("perf").unwrap().enabled_by = Some(vec!["#/results/perf".into()]);
        assert!(matches!(
            sysdef.validate(),
            Err(DefinitionError::CyclicEnabledBy(_))
        ));
    }

    #[test]
    fn test_enabled_by_must_resolve() {
        let mut sysdef = sample_sysdef();
        sysdef.results.get_mut("waveform").unwrap().enabled_by =
            Some(vec!["#/run_parameters/missing".into()]);
        assert!(matches!(
            sysdef.validate(),
            Err(DefinitionError::UnresolvedReference { .. })
        ));

        sysdef.results.get_mut("waveform").unwrap().enabled_by = Some(vec!["run_parameters/trace".into()]);
        assert!(matches!(sysdef.validate(), Err(DefinitionError::InvalidPointer { .. })));

        sysdef.results.get_mut("waveform").unwrap().enabled_by =
            Some(vec!["#/run_parameters/clock_mhz".into()]);
        assert!(matches!(
            sysdef.validate(),
            Err(DefinitionError::NonBooleanEnabler { .. })
        ));
    }

    #[test]
    fn test_invalid_defaults_are_rejected() {
        let mut sysdef = sample_sysdef();
        sysdef.run_parameters.insert(
            "isa".into(),
            ParameterSpec::Detailed(DetailedParameter {
                default_value: ParameterValue::String("arm".into()),
                meta: Some(ParameterMeta::Enum {
                    values: vec![ParameterValue::String("rv32imc".into())],
                }),
                description: None,
            }),
        );
        assert!(matches!(sysdef.validate(), Err(DefinitionError::InvalidDefault { .. })));

        let mut sysdef = sample_sysdef();
        sysdef.common_parameters.insert(
            "core_count".into(),
            ParameterSpec::Detailed(DetailedParameter {
                default_value: ParameterValue::Integer(16),
                meta: Some(ParameterMeta::Range { lower: 1.0, upper: 8.0 }),
                description: None,
            }),
        );
        assert!(matches!(sysdef.validate(), Err(DefinitionError::InvalidDefault { .. })));
    }

    #[test]
    fn test_slot_paths_stay_inside_workdir() {
        let mut sysdef = sample_sysdef();
        sysdef.results.get_mut("perf").unwrap().path = "../etc/passwd".into();
        assert!(matches!(sysdef.validate(), Err(DefinitionError::InvalidSlotPath { .. })));
    }

    #[test]
    fn test_slot_names_must_be_identifiers() {
        for hostile in ["/../../../escaped", "../up", "a/b", ".hidden", ""] {
            let mut sysdef = sample_sysdef();
            let slot = sysdef.results["perf"].clone();
            sysdef.results.insert(hostile.to_string(), slot);
            assert_eq!(
                sysdef.validate(),
                Err(DefinitionError::InvalidSlotName(hostile.to_string())),
                "slot name {:?}",
                hostile
            );
        }
    }

    #[test]
    fn test_build_step() {
        let mut sysdef = sample_sysdef();
        assert_eq!(sysdef.build_step(), None);
        sysdef.build_command = Some("   ".into());
        assert_eq!(sysdef.build_step(), None);
        sysdef.build_command = Some(" make -C /opt/vp ".into());
        assert_eq!(sysdef.build_step(), Some("make -C /opt/vp"));
    }

    #[test]
    fn test_file_reference_values() {
        let sysdef = sample_sysdef();
        let firmware = sysdef.parameter(ParameterGroup::Run, "firmware").unwrap();
        let reference: ParameterValue =
            serde_json::from_value(serde_json::json!({ "url": "https://files.example.com/fw.elf" })).unwrap();
        assert_eq!(reference.kind(), ValueKind::Url);
        assert_eq!(firmware.check(&reference), Ok(reference.clone()));

        let local: ParameterValue = serde_json::from_value(serde_json::json!({ "url": "file:///etc/shadow" })).unwrap();
        assert!(matches!(firmware.check(&local), Err(ValueRejection::Constraint(_))));

        // only file parameters take references
        let isa = sysdef.parameter(ParameterGroup::Run, "isa").unwrap();
        assert_eq!(
            isa.check(&reference),
            Err(ValueRejection::Kind {
                expected: ValueKind::String,
                found: ValueKind::Url
            })
        );

        let secret = FileReference {
            url: "https://files.example.com/fw.elf".into(),
            credentials: Some("s3cret".into()),
        };
        assert!(!format!("{:?}", secret).contains("s3cret"));
    }

    #[test]
    fn test_missing_run_command() {
        let mut sysdef = sample_sysdef();
        sysdef.run_command = "  ".into();
        assert_eq!(sysdef.validate(), Err(DefinitionError::MissingField("run_command")));
    }

    #[test]
    fn test_required_slots_follow_enablers() {
        let sysdef = sample_sysdef();
        let mut syscfg = SystemConfiguration::from_sysdef(&sysdef);
        let resolved = syscfg.validate(&sysdef).unwrap();
        let required: Vec<_> = sysdef.required_slots(&resolved).into_iter().collect();
        assert_eq!(required, vec!["perf", "speed"]);

        syscfg
            .run_parameters
            .get_or_insert_with(Default::default)
            .insert("trace".into(), ParameterValue::Bool(true));
        let resolved = syscfg.validate(&sysdef).unwrap();
        assert!(sysdef.required_slots(&resolved).contains("waveform"));
        // enabled but declared optional
        assert!(sysdef.slot_enabled("hotspots", &resolved));
        assert!(!sysdef.required_slots(&resolved).contains("hotspots"));
    }

    #[test]
    fn test_enabler_pointer_parsing() {
        assert_eq!(
            EnablerRef::parse("#/run_parameters/trace"),
            Some(EnablerRef::Parameter(ParameterGroup::Run, "trace".into()))
        );
        assert_eq!(
            EnablerRef::parse("#/results/perf"),
            Some(EnablerRef::Result("perf".into()))
        );
        assert_eq!(EnablerRef::parse("#/other/perf"), None);
        assert_eq!(EnablerRef::parse("#/results/a/b"), None);
    }
}
