use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// What a session does when a read returns less than a full measurement frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortReadPolicy {
    /// Forward the 40-byte buffer as is; the tail holds stale bytes.
    #[default]
    Forward,
    /// Keep reading until the frame is complete, within the same deadline.
    Reassemble,
    /// Drop the connection.
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Admission cap on concurrently logged-in devices.
    pub max_devices: usize,
    pub login_timeout_ms: u64,
    pub liveness_timeout_ms: u64,
    pub command_queue_capacity: usize,
    pub short_read_policy: ShortReadPolicy,
    /// Period of the daemon's stats log line; 0 disables it.
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 1337,
            max_devices: 1000,
            login_timeout_ms: 1000,
            liveness_timeout_ms: 2000,
            command_queue_capacity: 1024,
            short_read_policy: ShortReadPolicy::Forward,
            stats_interval_secs: 0,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            short_read_policy: self.short_read_policy,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.login_timeout_ms == 0 {
            anyhow::bail!("login_timeout_ms must be greater than zero");
        }
        if self.liveness_timeout_ms == 0 {
            anyhow::bail!("liveness_timeout_ms must be greater than zero");
        }
        if self.command_queue_capacity == 0 {
            anyhow::bail!("command_queue_capacity must be greater than zero");
        }
        Ok(())
    }
}

/// Per-connection settings handed to each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub liveness_timeout: Duration,
    pub short_read_policy: ShortReadPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        ServerConfig::default().session()
    }
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<ServerConfig> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
    let config: ServerConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating config: {}", path.display()))?;
    Ok(config)
}
