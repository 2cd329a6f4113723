//! skynet.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::time::parse_duration;

/// Problems found by [`ControlPlaneConfig::validate`].
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid duration for {field}: {value:?}")]
    Duration { field: &'static str, value: String },

    #[error("scoring weights must be non-negative and sum to 1.0 (got {0})")]
    Weights(f64),

    #[error("reaper ttl ({ttl:?}) must exceed the dispatch timeout ({dispatch:?})")]
    TtlTooShort { ttl: Duration, dispatch: Duration },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("duplicate gateway id: {0}")]
    DuplicateGateway(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub store: StoreSettings,
    pub scheduler: SchedulerSettings,
    pub reaper: ReaperSettings,
    pub health: HealthSettings,
    pub scoring: ScoringSettings,
    pub gateways: Vec<GatewayConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
    pub default_max_retries: u32,
    /// How long one transaction waits while another process holds the file.
    pub lock_timeout: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("skynet.redb"),
            default_max_retries: 3,
            lock_timeout: "10s".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Number of concurrent scheduler loops.
    pub instances: u32,
    /// Ready tasks pulled per iteration.
    pub batch_size: usize,
    pub poll_interval: String,
    pub dispatch_timeout: String,
    /// How often an in-flight dispatch renews its claim.
    pub renew_interval: String,
    pub renew_extension: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            instances: 2,
            batch_size: 10,
            poll_interval: "1500ms".to_string(),
            dispatch_timeout: "120s".to_string(),
            renew_interval: "30s".to_string(),
            renew_extension: "300s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperSettings {
    pub ttl: String,
    /// Staleness past which owner health no longer protects a claim.
    pub ceiling: String,
    pub interval: String,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            ttl: "300s".to_string(),
            ceiling: "3600s".to_string(),
            interval: "15s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval: String,
    pub heartbeat_timeout: String,
    pub degraded_after: String,
    pub probe_timeout: String,
    pub unhealthy_threshold: u32,
    /// Probe gateway `/status` endpoints in addition to heartbeat ageing.
    pub probe: bool,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval: "10s".to_string(),
            heartbeat_timeout: "60s".to_string(),
            degraded_after: "30s".to_string(),
            probe_timeout: "5s".to_string(),
            unhealthy_threshold: 3,
            probe: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSettings {
    pub health: f64,
    pub load: f64,
    pub capability: f64,
    pub success: f64,
    pub latency: f64,
    pub latency_ceiling_ms: u64,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            health: 0.30,
            load: 0.25,
            capability: 0.25,
            success: 0.15,
            latency: 0.05,
            latency_ceiling_ms: 60_000,
        }
    }
}

/// A gateway registered at daemon start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub gateway_id: String,
    pub endpoint: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
}

fn default_capacity() -> u32 {
    4
}

impl ControlPlaneConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ControlPlaneConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.store.lock_timeout()?;
        let dispatch = self.scheduler.dispatch_timeout()?;
        self.scheduler.poll_interval()?;
        self.scheduler.renew_interval()?;
        self.scheduler.renew_extension()?;
        let ttl = self.reaper.ttl()?;
        self.reaper.ceiling()?;
        self.reaper.interval()?;
        self.health.interval()?;
        self.health.heartbeat_timeout()?;
        self.health.degraded_after()?;
        self.health.probe_timeout()?;

        if ttl <= dispatch {
            return Err(ConfigError::TtlTooShort { ttl, dispatch });
        }
        if self.scheduler.instances == 0 {
            return Err(ConfigError::Zero("scheduler.instances"));
        }
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::Zero("scheduler.batch_size"));
        }

        let s = &self.scoring;
        let weights = [s.health, s.load, s.capability, s.success, s.latency];
        let sum: f64 = weights.iter().sum();
        if weights.iter().any(|w| *w < 0.0) || (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Weights(sum));
        }

        let mut seen = std::collections::HashSet::new();
        for gw in &self.gateways {
            if !seen.insert(gw.gateway_id.as_str()) {
                return Err(ConfigError::DuplicateGateway(gw.gateway_id.clone()));
            }
        }
        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::Duration {
        field,
        value: value.to_string(),
    })
}

impl StoreSettings {
    pub fn lock_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("store.lock_timeout", &self.lock_timeout)
    }
}

impl SchedulerSettings {
    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("scheduler.poll_interval", &self.poll_interval)
    }

    pub fn dispatch_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("scheduler.dispatch_timeout", &self.dispatch_timeout)
    }

    pub fn renew_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("scheduler.renew_interval", &self.renew_interval)
    }

    pub fn renew_extension(&self) -> Result<Duration, ConfigError> {
        duration_field("scheduler.renew_extension", &self.renew_extension)
    }
}

impl ReaperSettings {
    pub fn ttl(&self) -> Result<Duration, ConfigError> {
        duration_field("reaper.ttl", &self.ttl)
    }

    pub fn ceiling(&self) -> Result<Duration, ConfigError> {
        duration_field("reaper.ceiling", &self.ceiling)
    }

    pub fn interval(&self) -> Result<Duration, ConfigError> {
        duration_field("reaper.interval", &self.interval)
    }
}

impl HealthSettings {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        duration_field("health.interval", &self.interval)
    }

    pub fn heartbeat_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("health.heartbeat_timeout", &self.heartbeat_timeout)
    }

    pub fn degraded_after(&self) -> Result<Duration, ConfigError> {
        duration_field("health.degraded_after", &self.degraded_after)
    }

    pub fn probe_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("health.probe_timeout", &self.probe_timeout)
    }
}
