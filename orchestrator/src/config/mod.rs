//! Configuration module for the Runtime Manager
//!
//! Supports configuration via:
//! - TOML/YAML/JSON config files
//! - Environment variables (with RTM_ prefix, `__` between sections)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for the JSON log file
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Session records, workspaces and stored artifacts
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory tree of system definition documents
    #[serde(default = "default_systems_dir")]
    pub systems_dir: PathBuf,

    /// In-flight HTTP request limit
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Session lifecycle settings
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Container runtime settings
    #[serde(default)]
    pub container: ContainerConfig,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Admission, timeouts and retention of sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum number of non-terminal sessions
    #[serde(default = "default_max_active_sessions")]
    pub max_active_sessions: usize,

    /// Run timeout when a request names none
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    /// Upper bound for requested run timeouts
    #[serde(default = "default_max_timeout_seconds")]
    pub max_timeout_seconds: u64,

    #[serde(default = "default_provision_timeout_seconds")]
    pub provision_timeout_seconds: u64,

    /// Wait after each termination signal before escalating
    #[serde(default = "default_cancel_grace_seconds")]
    pub cancel_grace_seconds: u64,

    /// How long terminal sessions stay in the live set
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: u64,

    #[serde(default = "default_gc_interval_seconds")]
    pub gc_interval_seconds: u64,

    /// Tail of container output kept per session
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

/// Which container runtime drives sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Docker,
    Podman,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeKind,

    /// Docker/Podman API socket; local defaults when unset
    #[serde(default)]
    pub socket: Option<String>,

    /// Podman binary; looked up on PATH when unset
    #[serde(default)]
    pub podman_path: Option<PathBuf>,

    /// Mount point of the session workspace inside the container
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Pull images that are missing locally
    #[serde(default = "default_true")]
    pub pull_images: bool,

    /// Pass host proxy variables into containers
    #[serde(default = "default_true")]
    pub forward_proxy_env: bool,

    #[serde(default)]
    pub network_enabled: bool,

    /// Cancel running sessions when the service shuts down
    #[serde(default = "default_true")]
    pub stop_containers_on_shutdown: bool,

    #[serde(default)]
    pub limits: ResourceLimits,
}

/// Resource limits for a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum memory in megabytes
    #[serde(default = "default_memory_mb")]
    pub max_memory_mb: u64,

    /// Maximum CPU cores (can be fractional)
    #[serde(default = "default_cpus")]
    pub max_cpus: f64,

    /// Maximum number of processes
    #[serde(default = "default_pids")]
    pub max_pids: u32,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/runtime-manager")
}

fn default_systems_dir() -> PathBuf {
    PathBuf::from("/var/lib/runtime-manager/systems")
}

fn default_max_concurrent_requests() -> usize {
    256
}

fn default_max_active_sessions() -> usize {
    8
}

fn default_timeout_seconds() -> u64 {
    3600
}

fn default_max_timeout_seconds() -> u64 {
    86400
}

fn default_provision_timeout_seconds() -> u64 {
    300
}

fn default_cancel_grace_seconds() -> u64 {
    10
}

fn default_retention_seconds() -> u64 {
    3600
}

fn default_gc_interval_seconds() -> u64 {
    60
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_runtime() -> RuntimeKind {
    RuntimeKind::Docker
}

fn default_workdir() -> String {
    "/sysapi".to_string()
}

fn default_memory_mb() -> u64 {
    4096
}

fn default_cpus() -> f64 {
    2.0
}

fn default_pids() -> u32 {
    512
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: default_max_active_sessions(),
            default_timeout_seconds: default_timeout_seconds(),
            max_timeout_seconds: default_max_timeout_seconds(),
            provision_timeout_seconds: default_provision_timeout_seconds(),
            cancel_grace_seconds: default_cancel_grace_seconds(),
            retention_seconds: default_retention_seconds(),
            gc_interval_seconds: default_gc_interval_seconds(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl SessionConfig {
    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_seconds)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds)
    }

    /// Clamp a requested run timeout to the configured bounds
    pub fn effective_timeout(&self, requested: Option<u64>) -> u64 {
        requested
            .filter(|secs| *secs > 0)
            .unwrap_or(self.default_timeout_seconds)
            .min(self.max_timeout_seconds)
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            socket: None,
            podman_path: None,
            workdir: default_workdir(),
            pull_images: true,
            forward_proxy_env: true,
            network_enabled: false,
            stop_containers_on_shutdown: true,
            limits: ResourceLimits::default(),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: default_memory_mb(),
            max_cpus: default_cpus(),
            max_pids: default_pids(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_dir: default_log_dir(),
            data_dir: default_data_dir(),
            systems_dir: default_systems_dir(),
            max_concurrent_requests: default_max_concurrent_requests(),
            sessions: SessionConfig::default(),
            container: ContainerConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        // Try to load .env file if present
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config/runtime-manager").required(false))
            .add_source(config::File::with_name("/etc/runtime-manager/config").required(false))
            // e.g. RTM_SESSIONS__MAX_ACTIVE_SESSIONS=4
            .add_source(
                config::Environment::with_prefix("RTM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Port cannot be 0");
        }

        if self.max_concurrent_requests == 0 {
            anyhow::bail!("max_concurrent_requests must be at least 1");
        }

        let sessions = &self.sessions;
        if sessions.max_active_sessions == 0 {
            anyhow::bail!("sessions.max_active_sessions must be at least 1");
        }

        if sessions.default_timeout_seconds == 0 || sessions.provision_timeout_seconds == 0 {
            anyhow::bail!("Session timeouts cannot be 0");
        }

        if sessions.default_timeout_seconds > sessions.max_timeout_seconds {
            anyhow::bail!(
                "sessions.default_timeout_seconds ({}) exceeds sessions.max_timeout_seconds ({})",
                sessions.default_timeout_seconds,
                sessions.max_timeout_seconds
            );
        }

        if sessions.gc_interval_seconds == 0 {
            anyhow::bail!("sessions.gc_interval_seconds cannot be 0");
        }

        if !self.container.workdir.starts_with('/') {
            anyhow::bail!("container.workdir must be an absolute path");
        }

        if self.container.limits.max_memory_mb < 64 {
            anyhow::bail!("Minimum memory limit is 64MB");
        }

        if self.container.limits.max_cpus <= 0.0 {
            anyhow::bail!("container.limits.max_cpus must be positive");
        }

        Ok(())
    }

    /// Root of per-session directories
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.sessions.max_active_sessions, 8);
        assert_eq!(config.container.workdir, "/sysapi");
        assert_eq!(config.container.runtime, RuntimeKind::Docker);
        assert!(!config.container.network_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let config = AppConfig {
            port: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sessions.default_timeout_seconds = config.sessions.max_timeout_seconds + 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.container.workdir = "sysapi".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_effective_timeout() {
        let sessions = SessionConfig {
            default_timeout_seconds: 60,
            max_timeout_seconds: 600,
            ..SessionConfig::default()
        };
        assert_eq!(sessions.effective_timeout(None), 60);
        assert_eq!(sessions.effective_timeout(Some(0)), 60);
        assert_eq!(sessions.effective_timeout(Some(120)), 120);
        assert_eq!(sessions.effective_timeout(Some(100_000)), 600);
    }

    #[test]
    fn test_runtime_kind_from_string() {
        let container: ContainerConfig =
            serde_json::from_value(serde_json::json!({ "runtime": "podman" })).unwrap();
        assert_eq!(container.runtime, RuntimeKind::Podman);
        assert_eq!(container.workdir, "/sysapi");
    }
}
