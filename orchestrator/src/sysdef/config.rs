//! System Configuration documents and their validation against a SysDef

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    FileReference, ParameterGroup, ParameterValue, SystemDefinition, ValueKind, ValueRejection, SYSCFG_DATAFORMAT,
};

/// Identity of a system definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SystemRef {
    pub name: String,
    pub version: String,
}

impl SystemRef {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for SystemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// SysCfg document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfiguration {
    #[serde(default = "default_syscfg_dataformat")]
    pub dataformat: String,

    pub system: SystemRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub common_parameters: Option<BTreeMap<String, ParameterValue>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_parameters: Option<BTreeMap<String, ParameterValue>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_parameters: Option<BTreeMap<String, ParameterValue>>,
}

/// Reasons a SysCfg does not fit its SysDef
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("configuration targets {found} but the definition is {expected}")]
    SystemMismatch { expected: SystemRef, found: SystemRef },

    #[error("parameter '{name}' is not declared in {group}")]
    UndeclaredParameter { group: ParameterGroup, name: String },

    #[error("parameter '{name}' in {group} expects {expected}, got {found}")]
    TypeMismatch {
        group: ParameterGroup,
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },

    #[error("parameter '{name}' in {group} violates its constraint: {reason}")]
    ConstraintViolation {
        group: ParameterGroup,
        name: String,
        reason: String,
    },
}

impl SystemConfiguration {
    /// Default configuration: every declared parameter set to its default
    pub fn from_sysdef(sysdef: &SystemDefinition) -> Self {
        let defaults = |group| {
            let params: BTreeMap<String, ParameterValue> = sysdef
                .parameters(group)
                .iter()
                .map(|(name, spec)| (name.clone(), spec.default_value().clone()))
                .collect();
            Some(params)
        };

        Self {
            dataformat: SYSCFG_DATAFORMAT.to_string(),
            system: sysdef.reference(),
            common_parameters: defaults(ParameterGroup::Common),
            build_parameters: defaults(ParameterGroup::Build),
            run_parameters: defaults(ParameterGroup::Run),
        }
    }

    pub fn parameters(&self, group: ParameterGroup) -> Option<&BTreeMap<String, ParameterValue>> {
        match group {
            ParameterGroup::Common => self.common_parameters.as_ref(),
            ParameterGroup::Build => self.build_parameters.as_ref(),
            ParameterGroup::Run => self.run_parameters.as_ref(),
        }
    }

    /// Check every assignment against `sysdef` and fill in defaults.
    pub fn validate(&self, sysdef: &SystemDefinition) -> Result<ResolvedConfiguration, ConfigError> {
        let expected = sysdef.reference();
        if self.system != expected {
            return Err(ConfigError::SystemMismatch {
                expected,
                found: self.system.clone(),
            });
        }

        let mut groups = BTreeMap::new();
        for group in ParameterGroup::ALL {
            let declared = sysdef.parameters(group);
            let mut resolved: BTreeMap<String, ParameterValue> = declared
                .iter()
                .map(|(name, spec)| (name.clone(), spec.default_value().clone()))
                .collect();

            for (name, value) in self.parameters(group).into_iter().flatten() {
                let spec = declared
                    .get(name)
                    .ok_or_else(|| ConfigError::UndeclaredParameter {
                        group,
                        name: name.clone(),
                    })?;

                let value = spec.check(value).map_err(|rejection| match rejection {
                    ValueRejection::Kind { expected, found } => ConfigError::TypeMismatch {
                        group,
                        name: name.clone(),
                        expected,
                        found,
                    },
                    ValueRejection::Constraint(reason) => ConfigError::ConstraintViolation {
                        group,
                        name: name.clone(),
                        reason,
                    },
                })?;
                resolved.insert(name.clone(), value);
            }
            groups.insert(group, resolved);
        }

        Ok(ResolvedConfiguration {
            system: expected,
            groups,
        })
    }
}

/// File parameter to download into the workspace before the run
#[derive(Debug, Clone, PartialEq)]
pub struct FileInput {
    pub group: ParameterGroup,
    pub name: String,
    pub source: FileReference,
    /// Destination relative to the workspace root
    pub relative_path: String,
}

/// Complete, validated parameter assignment of one session
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfiguration {
    system: SystemRef,
    groups: BTreeMap<ParameterGroup, BTreeMap<String, ParameterValue>>,
}

impl ResolvedConfiguration {
    pub fn system(&self) -> &SystemRef {
        &self.system
    }

    pub fn get(&self, group: ParameterGroup, name: &str) -> Option<&ParameterValue> {
        self.groups.get(&group).and_then(|params| params.get(name))
    }

    /// Back to document form, every parameter present
    pub fn to_syscfg(&self) -> SystemConfiguration {
        let group = |group| Some(self.groups.get(&group).cloned().unwrap_or_default());
        SystemConfiguration {
            dataformat: SYSCFG_DATAFORMAT.to_string(),
            system: self.system.clone(),
            common_parameters: group(ParameterGroup::Common),
            build_parameters: group(ParameterGroup::Build),
            run_parameters: group(ParameterGroup::Run),
        }
    }

    /// Replace every file reference by the path its download will have in
    /// the container, returning the downloads to perform
    pub fn localize_files(mut self, workdir: &str) -> (ResolvedConfiguration, Vec<FileInput>) {
        let workdir = workdir.trim_end_matches('/');
        let mut inputs = Vec::new();

        for (group, params) in self.groups.iter_mut() {
            for (name, value) in params.iter_mut() {
                let ParameterValue::Url(reference) = value else {
                    continue;
                };
                let source = reference.clone();
                let relative_path = format!("inputs/{}/{}/{}", group.key(), name, download_name(&source.url));
                *value = ParameterValue::String(format!("{}/{}", workdir, relative_path));
                inputs.push(FileInput {
                    group: *group,
                    name: name.clone(),
                    source,
                    relative_path,
                });
            }
        }

        (self, inputs)
    }

    /// `RTM_<GROUP>_<NAME>` variables for the container environment
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.groups
            .iter()
            .flat_map(|(group, params)| {
                params.iter().map(move |(name, value)| {
                    let name: String = name
                        .chars()
                        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
                        .collect();
                    (format!("RTM_{}_{}", group.env_prefix(), name), value.to_string())
                })
            })
            .collect()
    }
}

/// Last path segment of a URL, reduced to a safe file name
fn download_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or_default();
    let after_scheme = without_query.split_once("://").map_or(without_query, |(_, rest)| rest);
    let segment = after_scheme
        .split_once('/')
        .map_or("", |(_, path)| path.rsplit('/').next().unwrap_or_default());

    let name: String = segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if name.trim_start_matches('.').is_empty() {
        "input".to_string()
    } else {
        name
    }
}

fn default_syscfg_dataformat() -> String {
    SYSCFG_DATAFORMAT.to_string()
}
