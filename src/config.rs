use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::dispatch::DispatchTimeouts;

/// Configuration for Docker-based job execution.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// How local hosts start job processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Runtime {
    /// Plain child processes; the image is ignored.
    #[default]
    Process,
    /// Sandboxed Docker containers.
    Docker,
}

/// Host placement policy for new jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    Random,
    LeastLoaded,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one host is required")]
    NoHosts,

    #[error("invalid host ID {0:?}: must be non-empty and must not contain '-'")]
    InvalidHostId(String),

    #[error("duplicate host ID {0:?}")]
    DuplicateHost(String),
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub listen_addr: SocketAddr,
    /// IDs of the local hosts to run.
    pub hosts: Vec<String>,
    pub runtime: Runtime,
    pub placement: Placement,
    pub sandbox: SandboxConfig,
    /// JSON file with apps, releases and artifacts to load at startup.
    pub catalog_path: Option<PathBuf>,
    pub attach_wait_timeout_ms: u64,
    pub attach_drain_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:1200"
                .parse()
                .expect("default listen address is valid"),
            hosts: Vec::new(),
            runtime: Runtime::default(),
            placement: Placement::default(),
            sandbox: SandboxConfig::default(),
            catalog_path: None,
            attach_wait_timeout_ms: 30_000,
            attach_drain_timeout_ms: 1_000,
        }
    }
}

impl ControllerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_host(mut self, host_id: impl Into<String>) -> Self {
        self.hosts.push(host_id.into());
        self
    }

    /// Check that host IDs can be used in composite job IDs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }
        for (i, host) in self.hosts.iter().enumerate() {
            if host.is_empty() || host.contains('-') {
                return Err(ConfigError::InvalidHostId(host.clone()));
            }
            if self.hosts[..i].contains(host) {
                return Err(ConfigError::DuplicateHost(host.clone()));
            }
        }
        Ok(())
    }

    pub fn attach_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_wait_timeout_ms)
    }

    pub fn dispatch_timeouts(&self) -> DispatchTimeouts {
        DispatchTimeouts {
            attach_wait: self.attach_wait_timeout(),
            drain: Duration::from_millis(self.attach_drain_timeout_ms),
        }
    }
}
