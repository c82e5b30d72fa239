use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating the startup configuration.
/// All of these are fatal at startup; nothing here is retried mid-cycle.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(String),

    #[error("Unknown aggregation policy '{0}', expected one of: average, sum, max")]
    UnknownPolicy(String),

    #[error("batch_size must be at least 1")]
    ZeroBatchSize,

    #[error("result_window_secs must be positive, got {0}")]
    NonPositiveResultWindow(f64),

    #[error("slots_per_cycle must be at least 1")]
    ZeroSlotsPerCycle,

    #[error("slot_duration_secs must be positive, got {0}")]
    NonPositiveSlotDuration(f64),

    #[error("min_reputation must be finite, got {0}")]
    InvalidReputationThreshold(f64),

    #[error("scoring.success_value must be finite and non-negative, got {0}")]
    InvalidSuccessValue(f64),

    #[error("scoring.timeout_penalty must be finite, got {0}")]
    InvalidTimeoutPenalty(f64),

    #[error("api_bind_addr '{0}' is not a valid socket address")]
    InvalidBindAddr(String),
}

/// How a miner's per-task scores within one slot fold into a single
/// contribution. Parsed at load time; an unknown name is a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPolicy {
    Average,
    Sum,
    Max,
}

impl FromStr for AggregationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "average" => Ok(AggregationPolicy::Average),
            "sum" => Ok(AggregationPolicy::Sum),
            "max" => Ok(AggregationPolicy::Max),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

impl std::fmt::Display for AggregationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregationPolicy::Average => write!(f, "average"),
            AggregationPolicy::Sum => write!(f, "sum"),
            AggregationPolicy::Max => write!(f, "max"),
        }
    }
}

/// Thresholds a miner must meet to be dispatch-eligible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EligibilityCriteria {
    pub min_stake: u64,
    pub min_reputation: f64,
}

impl Default for EligibilityCriteria {
    fn default() -> Self {
        Self {
            min_stake: 0,
            min_reputation: 0.0,
        }
    }
}

/// Per-task score shaping: the value a clean success earns before quality
/// scaling, and the contribution recorded for a timeout or malformed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub success_value: f64,
    pub timeout_penalty: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            success_value: 1.0,
            timeout_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// RPC endpoint of the chain providing the slot clock.
    pub rpc_url: String,
    /// Maximum miners assigned tasks in one slot.
    pub batch_size: usize,
    /// Duration of the result-acceptance window after dispatch.
    pub result_window_secs: f64,
    /// Number of consecutive slots folded into one finalized cycle.
    pub slots_per_cycle: u64,
    pub aggregation_policy: AggregationPolicy,
    #[serde(default)]
    pub eligibility: EligibilityCriteria,
    #[serde(default)]
    pub scoring: ScoringConfig,
    /// Estimated slot duration, used to bound the slot oracle cache.
    #[serde(default = "default_slot_duration_secs")]
    pub slot_duration_secs: f64,
    /// Poll interval while waiting for a new slot.
    #[serde(default = "default_slot_poll_interval_ms")]
    pub slot_poll_interval_ms: u64,
    /// Per-miner network send timeout.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Timeout for chain RPC calls made by the slot oracle.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Address the inbound result API binds to.
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    /// Base delay for oracle retry backoff; doubles up to the cap below.
    #[serde(default = "default_backoff_base_ms")]
    pub oracle_backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub oracle_backoff_max_ms: u64,
}

fn default_slot_duration_secs() -> f64 {
    12.0
}

fn default_slot_poll_interval_ms() -> u64 {
    1_000
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_rpc_timeout_ms() -> u64 {
    10_000
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            batch_size: 8,
            result_window_secs: 10.0,
            slots_per_cycle: 10,
            aggregation_policy: AggregationPolicy::Average,
            eligibility: EligibilityCriteria::default(),
            scoring: ScoringConfig::default(),
            slot_duration_secs: default_slot_duration_secs(),
            slot_poll_interval_ms: default_slot_poll_interval_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            api_bind_addr: default_api_bind_addr(),
            oracle_backoff_base_ms: default_backoff_base_ms(),
            oracle_backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl ValidatorConfig {
    /// Loads and validates a TOML config file. Any invalid value is
    /// rejected here, before the coordinator starts.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        let config: ValidatorConfig =
            toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if !(self.result_window_secs > 0.0) {
            return Err(ConfigError::NonPositiveResultWindow(self.result_window_secs));
        }
        if self.slots_per_cycle == 0 {
            return Err(ConfigError::ZeroSlotsPerCycle);
        }
        if !(self.slot_duration_secs > 0.0) {
            return Err(ConfigError::NonPositiveSlotDuration(self.slot_duration_secs));
        }
        if !self.eligibility.min_reputation.is_finite() {
            return Err(ConfigError::InvalidReputationThreshold(
                self.eligibility.min_reputation,
            ));
        }
        if !self.scoring.success_value.is_finite() || self.scoring.success_value < 0.0 {
            return Err(ConfigError::InvalidSuccessValue(self.scoring.success_value));
        }
        if !self.scoring.timeout_penalty.is_finite() {
            return Err(ConfigError::InvalidTimeoutPenalty(self.scoring.timeout_penalty));
        }
        if self.api_bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidBindAddr(self.api_bind_addr.clone()));
        }
        Ok(())
    }

    pub fn result_window(&self) -> Duration {
        Duration::from_secs_f64(self.result_window_secs)
    }

    pub fn slot_duration(&self) -> Duration {
        Duration::from_secs_f64(self.slot_duration_secs)
    }

    pub fn slot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.slot_poll_interval_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn oracle_backoff_base(&self) -> Duration {
        Duration::from_millis(self.oracle_backoff_base_ms)
    }

    pub fn oracle_backoff_max(&self) -> Duration {
        Duration::from_millis(self.oracle_backoff_max_ms)
    }
}
