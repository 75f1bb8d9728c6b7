//! Dispatch configuration.
//!
//! Loaded from TOML, optionally overridden by `DISPATCH_*` environment
//! variables (after reading `.env`), then validated.

use crate::collaborator::CollaboratorId;
use crate::error::ConfigError;
use crate::reliability::BreakerConfig;
use crate::selection::SelectionWeights;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

pub const ENV_PREFIX: &str = "DISPATCH_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub breaker: BreakerSettings,
    pub selection: SelectionWeights,
    pub orchestrator: OrchestratorSettings,
    pub channel: ChannelSettings,
    pub cache: CacheSettings,
    /// Static capability registry, keyed by collaborator id
    pub collaborators: BTreeMap<String, CollaboratorSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_ms: u64,
    pub probe_timeout_ms: Option<u64>,
    pub volume_threshold: Option<u32>,
    pub error_threshold_percentage: f64,
    pub history_limit: usize,
    pub unhealthy_failure_rate: f64,
    /// Per-collaborator replacements for any of the fields above
    pub overrides: BTreeMap<String, BreakerOverride>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            open_duration_ms: defaults.open_duration.as_millis() as u64,
            probe_timeout_ms: None,
            volume_threshold: None,
            error_threshold_percentage: defaults.error_threshold_percentage,
            history_limit: defaults.history_limit,
            unhealthy_failure_rate: defaults.unhealthy_failure_rate,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerOverride {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub open_duration_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub volume_threshold: Option<u32>,
    pub error_threshold_percentage: Option<f64>,
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
            open_duration: Duration::from_millis(self.open_duration_ms),
            probe_timeout: self.probe_timeout_ms.map(Duration::from_millis),
            volume_threshold: self.volume_threshold,
            error_threshold_percentage: self.error_threshold_percentage,
            history_limit: self.history_limit,
            unhealthy_failure_rate: self.unhealthy_failure_rate,
        }
    }

    /// Defaults with the collaborator's override applied, if any
    pub fn config_for(&self, collaborator: &str) -> BreakerConfig {
        let mut config = self.to_breaker_config();
        if let Some(o) = self.overrides.get(collaborator) {
            if let Some(v) = o.failure_threshold {
                config.failure_threshold = v;
            }
            if let Some(v) = o.success_threshold {
                config.success_threshold = v;
            }
            if let Some(v) = o.open_duration_ms {
                config.open_duration = Duration::from_millis(v);
            }
            if let Some(v) = o.probe_timeout_ms {
                config.probe_timeout = Some(Duration::from_millis(v));
            }
            if let Some(v) = o.volume_threshold {
                config.volume_threshold = Some(v);
            }
            if let Some(v) = o.error_threshold_percentage {
                config.error_threshold_percentage = v;
            }
        }
        config
    }

    pub fn override_configs(&self) -> HashMap<CollaboratorId, BreakerConfig> {
        self.overrides
            .keys()
            .map(|id| (CollaboratorId::from(id.as_str()), self.config_for(id)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub max_attempts: usize,
    pub attempt_timeout_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 30_000,
        }
    }
}

impl OrchestratorSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub default_timeout_ms: u64,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

impl ChannelSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl_ms: 3_600_000,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorKind {
    /// Remote agent reached through a correlated channel
    Remote,
    /// OpenAI-compatible HTTP provider
    Http,
    /// In-process implementation
    #[default]
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaboratorSettings {
    pub capabilities: Vec<String>,
    pub kind: CollaboratorKind,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    /// Environment variable holding the provider's API key
    pub api_key_env: Option<String>,
}

impl DispatchConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DispatchConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(
            path = %path.display(),
            collaborators = config.collaborators.len(),
            "Loaded dispatch configuration"
        );
        Ok(config)
    }

    /// Read `.env`, load `path` (or defaults when absent), then apply
    /// `DISPATCH_*` overrides from the process environment.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DISPATCH_*` overrides using `lookup` as the environment
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env_value(&lookup, "MAX_ATTEMPTS")? {
            self.orchestrator.max_attempts = v;
        }
        if let Some(v) = env_value(&lookup, "ATTEMPT_TIMEOUT_MS")? {
            self.orchestrator.attempt_timeout_ms = v;
        }
        if let Some(v) = env_value(&lookup, "FAILURE_THRESHOLD")? {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = env_value(&lookup, "OPEN_DURATION_MS")? {
            self.breaker.open_duration_ms = v;
        }
        if let Some(v) = env_value(&lookup, "CHANNEL_TIMEOUT_MS")? {
            self.channel.default_timeout_ms = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if self.breaker.success_threshold == 0 {
            return Err(ConfigError::invalid("breaker.success_threshold", "must be at least 1"));
        }
        if !(0.0..=100.0).contains(&self.breaker.error_threshold_percentage) {
            return Err(ConfigError::invalid(
                "breaker.error_threshold_percentage",
                "must be between 0 and 100",
            ));
        }
        for (id, o) in &self.breaker.overrides {
            if o.failure_threshold == Some(0) || o.success_threshold == Some(0) {
                return Err(ConfigError::invalid(
                    format!("breaker.overrides.{}", id),
                    "thresholds must be at least 1",
                ));
            }
        }

        let weights = &self.selection;
        if weights.success_weight < 0.0 || weights.speed_weight < 0.0 {
            return Err(ConfigError::invalid("selection", "weights must not be negative"));
        }
        if weights.success_weight == 0.0 && weights.speed_weight == 0.0 {
            return Err(ConfigError::invalid("selection", "at least one weight must be positive"));
        }
        if weights.speed_scale_ms < 0.0 {
            return Err(ConfigError::invalid("selection.speed_scale_ms", "must not be negative"));
        }

        if self.orchestrator.max_attempts == 0 {
            return Err(ConfigError::invalid("orchestrator.max_attempts", "must be at least 1"));
        }
        if self.orchestrator.attempt_timeout_ms == 0 {
            return Err(ConfigError::invalid("orchestrator.attempt_timeout_ms", "must be positive"));
        }
        if self.channel.default_timeout_ms == 0 {
            return Err(ConfigError::invalid("channel.default_timeout_ms", "must be positive"));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::invalid("cache.max_entries", "must be at least 1"));
        }

        for (id, collaborator) in &self.collaborators {
            if collaborator.capabilities.is_empty() {
                return Err(ConfigError::invalid(
                    format!("collaborators.{}.capabilities", id),
                    "a collaborator must advertise at least one capability",
                ));
            }
            if collaborator.kind == CollaboratorKind::Http && collaborator.endpoint.is_none() {
                return Err(ConfigError::invalid(
                    format!("collaborators.{}.endpoint", id),
                    "required for http collaborators",
                ));
            }
        }

        debug!("Dispatch configuration validated");
        Ok(())
    }

    pub fn collaborator(&self, id: &CollaboratorId) -> Result<&CollaboratorSettings, ConfigError> {
        self.collaborators
            .get(id.as_str())
            .ok_or_else(|| ConfigError::UnknownCollaborator(id.clone()))
    }
}

fn env_value<T, F>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match lookup(&key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, e.to_string())),
    }
}
