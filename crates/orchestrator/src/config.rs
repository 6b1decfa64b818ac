//! Orchestrator configuration
//!
//! `MedicConfig` is passed explicitly to `Orchestrator::new` and threaded to
//! the runtime, router, breaker and coordinator. Durations are stored as
//! `*_ms` integers so the struct round-trips through TOML and JSON.

use crate::reliability::CircuitBreakerConfig;
use anyhow::{Context, Result};
use common::{LogFormat, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

/// Lower bound applied by the loader to the oracle timeout
pub const MIN_ORACLE_TIMEOUT_MS: u64 = 5_000;
/// Upper bound applied by the loader to the oracle timeout
pub const MAX_ORACLE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Invalid value '{value}' in environment variable {var}")]
    InvalidEnv { var: String, value: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Circuit breaker policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub base_open_ms: u64,
    pub max_open_ms: u64,
    /// Healthy time after which the open duration falls back to base
    pub healthy_reset_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_open_ms: 5_000,
            max_open_ms: 300_000,
            healthy_reset_ms: 60_000,
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            base_open_duration: Duration::from_millis(self.base_open_ms),
            max_open_duration: Duration::from_millis(self.max_open_ms),
            healthy_reset_period: Duration::from_millis(self.healthy_reset_ms),
        }
    }
}

/// Failure routing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Consecutive transient failures retried locally
    pub local_retry_budget: u32,
    /// Consecutive failures that quarantine without diagnosis
    pub quarantine_threshold: u32,
    pub local_retry_delay_ms: u64,
    /// Identical logic-error signatures in the history window that count as non-recoverable
    pub logic_repeat_limit: u32,
    /// Recent error summaries kept per agent
    pub history_window: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            local_retry_budget: 2,
            quarantine_threshold: 10,
            local_retry_delay_ms: 200,
            logic_repeat_limit: 2,
            history_window: 5,
        }
    }
}

impl RouterConfig {
    pub fn local_retry_delay(&self) -> Duration {
        Duration::from_millis(self.local_retry_delay_ms)
    }
}

/// Healing coordinator policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealingConfig {
    pub oracle_timeout_ms: u64,
    /// Plans below this confidence are treated as an oracle failure
    pub min_plan_confidence: f64,
    /// Retries of a coalesced request whose shared outcome failed
    pub coalesced_retry_limit: u32,
}

impl Default for HealingConfig {
    fn default() -> Self {
        Self {
            oracle_timeout_ms: 10_000,
            min_plan_confidence: 0.5,
            coalesced_retry_limit: 1,
        }
    }
}

impl HealingConfig {
    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }
}

/// Execution and queueing limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Applied when a task carries no timeout of its own
    pub task_timeout_ms: u64,
    pub latency_window: usize,
    /// Pending tasks per agent, the running one included
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            task_timeout_ms: 30_000,
            latency_window: 100,
            queue_capacity: 32,
        }
    }
}

impl RuntimeConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MedicConfig {
    pub breaker: BreakerSettings,
    pub router: RouterConfig,
    pub healing: HealingConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

impl MedicConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.breaker.base_open_ms == 0 {
            return Err(invalid("breaker.base_open_ms", "must be greater than 0"));
        }
        if self.breaker.base_open_ms > self.breaker.max_open_ms {
            return Err(invalid(
                "breaker.max_open_ms",
                format!(
                    "{} is below base_open_ms {}",
                    self.breaker.max_open_ms, self.breaker.base_open_ms
                ),
            ));
        }
        if self.router.quarantine_threshold <= self.router.local_retry_budget {
            return Err(invalid(
                "router.quarantine_threshold",
                format!(
                    "{} must exceed local_retry_budget {}",
                    self.router.quarantine_threshold, self.router.local_retry_budget
                ),
            ));
        }
        if self.router.logic_repeat_limit == 0 {
            return Err(invalid("router.logic_repeat_limit", "must be at least 1"));
        }
        if self.router.history_window == 0 {
            return Err(invalid("router.history_window", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.healing.min_plan_confidence) {
            return Err(invalid(
                "healing.min_plan_confidence",
                "must be within 0.0..=1.0",
            ));
        }
        if self.healing.oracle_timeout_ms == 0 {
            return Err(invalid("healing.oracle_timeout_ms", "must be greater than 0"));
        }
        if self.runtime.queue_capacity == 0 {
            return Err(invalid("runtime.queue_capacity", "must be at least 1"));
        }
        if self.runtime.task_timeout_ms == 0 {
            return Err(invalid("runtime.task_timeout_ms", "must be greater than 0"));
        }
        self.logging
            .parse_level()
            .map_err(|e| invalid("logging.level", e.to_string()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

/// Loads `MedicConfig` from the first config file found, then environment
/// overrides, then validation.
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
    config_paths: Vec<PathBuf>,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            explicit_path: None,
            config_paths: Self::default_config_paths(),
            env_prefix: "MEDIC_".to_string(),
        }
    }

    /// A path that must exist and parse
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Replace the discovery list
    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.config_paths = paths;
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("medic.toml"),
            PathBuf::from("medic.json"),
            PathBuf::from(".medicrc"),
        ];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("medic").join("config.toml"));
        }
        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".config").join("medic").join("config.toml"));
        }

        paths
    }

    pub async fn load(&self) -> Result<MedicConfig> {
        let mut config = match &self.explicit_path {
            Some(path) => {
                let config = self
                    .load_file(path)
                    .await
                    .with_context(|| format!("Failed to load config from {}", path.display()))?;
                info!("Loaded configuration from: {}", path.display());
                config
            }
            None => self.load_discovered().await,
        };

        self.apply_env_overrides(&mut config)?;
        clamp_oracle_timeout(&mut config);
        config.validate()?;
        Ok(config)
    }

    async fn load_discovered(&self) -> MedicConfig {
        for path in &self.config_paths {
            if !path.exists() {
                continue;
            }
            match self.load_file(path).await {
                Ok(config) => {
                    info!("Loaded configuration from: {}", path.display());
                    return config;
                }
                Err(e) => {
                    warn!("Failed to load config from {}: {:#}", path.display(), e);
                }
            }
        }
        debug!("No configuration file found, using defaults");
        MedicConfig::default()
    }

    async fn load_file(&self, path: &Path) -> Result<MedicConfig> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&content).context("Failed to parse TOML config"),
            "json" => serde_json::from_str(&content).context("Failed to parse JSON config"),
            _ => toml::from_str(&content)
                .or_else(|_| serde_json::from_str(&content))
                .context("Failed to parse config file"),
        }
    }

    fn apply_env_overrides(&self, config: &mut MedicConfig) -> Result<(), ConfigError> {
        if let Some(v) = self.env_parse("FAILURE_THRESHOLD")? {
            config.breaker.failure_threshold = v;
        }
        if let Some(v) = self.env_parse("BASE_OPEN_MS")? {
            config.breaker.base_open_ms = v;
        }
        if let Some(v) = self.env_parse("MAX_OPEN_MS")? {
            config.breaker.max_open_ms = v;
        }
        if let Some(v) = self.env_parse("LOCAL_RETRY_BUDGET")? {
            config.router.local_retry_budget = v;
        }
        if let Some(v) = self.env_parse("QUARANTINE_THRESHOLD")? {
            config.router.quarantine_threshold = v;
        }
        if let Some(v) = self.env_parse("LOCAL_RETRY_DELAY_MS")? {
            config.router.local_retry_delay_ms = v;
        }
        if let Some(v) = self.env_parse("ORACLE_TIMEOUT_MS")? {
            config.healing.oracle_timeout_ms = v;
        }
        if let Some(v) = self.env_parse("MIN_PLAN_CONFIDENCE")? {
            config.healing.min_plan_confidence = v;
        }
        if let Some(v) = self.env_parse("TASK_TIMEOUT_MS")? {
            config.runtime.task_timeout_ms = v;
        }
        if let Some(v) = self.env_parse("QUEUE_CAPACITY")? {
            config.runtime.queue_capacity = v;
        }
        if let Some(level) = self.env_var("LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = self.env_var("LOG_FORMAT") {
            config.logging.format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: format!("{}LOG_FORMAT", self.env_prefix),
                        value: format,
                    })
                }
            };
        }
        Ok(())
    }

    fn env_var(&self, name: &str) -> Option<String> {
        env::var(format!("{}{}", self.env_prefix, name)).ok()
    }

    fn env_parse<T: FromStr>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        match self.env_var(name) {
            None => Ok(None),
            Some(value) => value
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidEnv {
                    var: format!("{}{}", self.env_prefix, name),
                    value,
                }),
        }
    }
}

fn clamp_oracle_timeout(config: &mut MedicConfig) {
    let requested = config.healing.oracle_timeout_ms;
    let clamped = requested.clamp(MIN_ORACLE_TIMEOUT_MS, MAX_ORACLE_TIMEOUT_MS);
    if clamped != requested {
        warn!(
            requested_ms = requested,
            clamped_ms = clamped,
            "Oracle timeout outside the supported range, clamped"
        );
        config.healing.oracle_timeout_ms = clamped;
    }
}
