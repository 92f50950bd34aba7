//! Agent configuration
//! YAML file read once at startup; the backend registry it declares is
//! fixed for the life of the process

use crate::domain::{BackendDescriptor, DomainError, RestartPolicy, Result};
use crate::logs::DEFAULT_RING_CAPACITY;
use crate::runner::{DEFAULT_GRACE_MS, DEFAULT_STOP_TIMEOUT_SEC};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// mTLS material for the control channel. All three files are
/// required; the channel never runs in the clear.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub client_ca_file: PathBuf,
}

/// Process runner tuning
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Startup grace window in milliseconds
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    /// SIGTERM to SIGKILL escalation timeout in seconds
    #[serde(default = "default_stop_timeout_sec")]
    pub stop_timeout_sec: u64,
}

fn default_grace_ms() -> u64 {
    DEFAULT_GRACE_MS
}

fn default_stop_timeout_sec() -> u64 {
    DEFAULT_STOP_TIMEOUT_SEC
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            stop_timeout_sec: default_stop_timeout_sec(),
        }
    }
}

/// Top-level agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    pub tls: TlsConfig,

    #[serde(default)]
    pub restart: RestartPolicy,

    #[serde(default)]
    pub runner: RunnerConfig,

    /// Log lines retained per backend for late subscribers
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,

    pub backends: Vec<BackendDescriptor>,
}

fn default_listen_addr() -> SocketAddr {
    // Historical default port of this node protocol
    "0.0.0.0:62050".parse().unwrap()
}

fn default_log_buffer_lines() -> usize {
    DEFAULT_RING_CAPACITY
}

impl AgentConfig {
    /// Read and validate the config file at `path`
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DomainError::io(&format!("reading config {}", path.display()), e))?;

        let config: AgentConfig = serde_yaml::from_str(&raw)
            .map_err(|e| DomainError::InvalidConfig(format!("config parse: {e}")))?;
        config.validate()?;

        info!(
            path = %path.display(),
            backends = config.backends.len(),
            listen = %config.listen_addr,
            "agent configuration loaded"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            return Err(DomainError::InvalidConfig(
                "at least one backend must be declared".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err(DomainError::InvalidConfig(
                    "backend id must not be empty".to_string(),
                ));
            }
            if !seen.insert(backend.id.as_str()) {
                return Err(DomainError::InvalidConfig(format!(
                    "duplicate backend id '{}'",
                    backend.id
                )));
            }
        }

        if self.log_buffer_lines == 0 {
            return Err(DomainError::InvalidConfig(
                "log_buffer_lines must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
