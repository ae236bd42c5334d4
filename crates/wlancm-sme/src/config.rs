//! Context configuration.
//!
//! Values come from built-in defaults, an optional TOML file and
//! environment overrides, applied in that order.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::{CommandClass, SmeCommandKind};
use crate::error::ConfigError;

/// Default values.
pub mod defaults {
    /// Command slots in the pool
    pub const COMMAND_POOL_SIZE: usize = 30;
    /// Consecutive failed acquisitions before recovery is requested
    pub const POOL_EXHAUSTION_THRESHOLD: u32 = 5;
    /// Policy-manager command response bound (ms)
    pub const POLICY_MGR_TIMEOUT_MS: u64 = 4_000;
    /// TWT command response bound (ms)
    pub const TWT_TIMEOUT_MS: u64 = 4_000;
    /// Roam command response bound (ms)
    pub const ROAM_TIMEOUT_MS: u64 = 10_000;
    /// Response bound for anything else (ms)
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
    /// TWT dialogs tracked per peer
    pub const MAX_TWT_SESSIONS_PER_PEER: usize = 8;
    /// Timeout monitor period (ms)
    pub const TIMEOUT_CHECK_INTERVAL_MS: u64 = 100;
    /// Lifecycle events kept in memory
    pub const EVENT_HISTORY: usize = 256;
}

/// Environment variable names.
pub mod env_vars {
    pub const COMMAND_POOL_SIZE: &str = "WLANCM_COMMAND_POOL_SIZE";
    pub const POOL_EXHAUSTION_THRESHOLD: &str = "WLANCM_POOL_EXHAUSTION_THRESHOLD";
    pub const POLICY_MGR_TIMEOUT_MS: &str = "WLANCM_POLICY_MGR_TIMEOUT_MS";
    pub const TWT_TIMEOUT_MS: &str = "WLANCM_TWT_TIMEOUT_MS";
    pub const ROAM_TIMEOUT_MS: &str = "WLANCM_ROAM_TIMEOUT_MS";
    pub const MAX_TWT_SESSIONS_PER_PEER: &str = "WLANCM_MAX_TWT_SESSIONS_PER_PEER";
    pub const TIMEOUT_CHECK_INTERVAL_MS: &str = "WLANCM_TIMEOUT_CHECK_INTERVAL_MS";

    fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    /// Pool size from the environment, or `current`.
    pub fn command_pool_size(current: usize) -> usize {
        parse_or(COMMAND_POOL_SIZE, current)
    }

    /// Exhaustion threshold from the environment, or `current`.
    pub fn pool_exhaustion_threshold(current: u32) -> u32 {
        parse_or(POOL_EXHAUSTION_THRESHOLD, current)
    }

    pub fn policy_mgr_timeout_ms(current: u64) -> u64 {
        parse_or(POLICY_MGR_TIMEOUT_MS, current)
    }

    pub fn twt_timeout_ms(current: u64) -> u64 {
        parse_or(TWT_TIMEOUT_MS, current)
    }

    pub fn roam_timeout_ms(current: u64) -> u64 {
        parse_or(ROAM_TIMEOUT_MS, current)
    }

    pub fn max_twt_sessions_per_peer(current: usize) -> usize {
        parse_or(MAX_TWT_SESSIONS_PER_PEER, current)
    }

    pub fn timeout_check_interval_ms(current: u64) -> u64 {
        parse_or(TIMEOUT_CHECK_INTERVAL_MS, current)
    }
}

/// Response bounds per command class, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub policy_mgr_ms: u64,
    pub twt_ms: u64,
    pub roam_ms: u64,
    pub default_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            policy_mgr_ms: defaults::POLICY_MGR_TIMEOUT_MS,
            twt_ms: defaults::TWT_TIMEOUT_MS,
            roam_ms: defaults::ROAM_TIMEOUT_MS,
            default_ms: defaults::DEFAULT_TIMEOUT_MS,
        }
    }
}

impl TimeoutConfig {
    /// Response bound for a command kind.
    pub fn for_kind(&self, kind: SmeCommandKind) -> Duration {
        let ms = match kind.class() {
            CommandClass::PolicyManager => self.policy_mgr_ms,
            CommandClass::Twt => self.twt_ms,
            CommandClass::Roam => self.roam_ms,
        };
        Duration::from_millis(if ms == 0 { self.default_ms } else { ms })
    }
}

/// Configuration for a [`MacContext`](crate::MacContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmeConfig {
    /// Number of reusable command slots
    pub command_pool_size: usize,
    /// Consecutive failed acquisitions that trigger recovery (0 disables)
    pub pool_exhaustion_threshold: u32,
    /// Per-class response bounds
    pub timeouts: TimeoutConfig,
    /// TWT dialogs tracked per peer
    pub max_twt_sessions_per_peer: usize,
    /// Timeout monitor period in milliseconds
    pub timeout_check_interval_ms: u64,
    /// Lifecycle events kept for inspection
    pub event_history: usize,
}

impl Default for SmeConfig {
    fn default() -> Self {
        Self {
            command_pool_size: defaults::COMMAND_POOL_SIZE,
            pool_exhaustion_threshold: defaults::POOL_EXHAUSTION_THRESHOLD,
            timeouts: TimeoutConfig::default(),
            max_twt_sessions_per_peer: defaults::MAX_TWT_SESSIONS_PER_PEER,
            timeout_check_interval_ms: defaults::TIMEOUT_CHECK_INTERVAL_MS,
            event_history: defaults::EVENT_HISTORY,
        }
    }
}

impl SmeConfig {
    /// Parse from TOML text. Missing fields keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: SmeConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply environment overrides on top of the current values.
    pub fn with_env_overrides(mut self) -> Self {
        self.command_pool_size = env_vars::command_pool_size(self.command_pool_size);
        self.pool_exhaustion_threshold =
            env_vars::pool_exhaustion_threshold(self.pool_exhaustion_threshold);
        self.timeouts.policy_mgr_ms = env_vars::policy_mgr_timeout_ms(self.timeouts.policy_mgr_ms);
        self.timeouts.twt_ms = env_vars::twt_timeout_ms(self.timeouts.twt_ms);
        self.timeouts.roam_ms = env_vars::roam_timeout_ms(self.timeouts.roam_ms);
        self.max_twt_sessions_per_peer =
            env_vars::max_twt_sessions_per_peer(self.max_twt_sessions_per_peer);
        self.timeout_check_interval_ms =
            env_vars::timeout_check_interval_ms(self.timeout_check_interval_ms);
        self
    }

    /// Reject values the context cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command_pool_size == 0 {
            return Err(ConfigError::Invalid(
                "command_pool_size must be at least 1".into(),
            ));
        }
        if self.timeouts.default_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeouts.default_ms must be non-zero".into(),
            ));
        }
        if self.timeout_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "timeout_check_interval_ms must be non-zero".into(),
            ));
        }
        if self.max_twt_sessions_per_peer == 0 {
            return Err(ConfigError::Invalid(
                "max_twt_sessions_per_peer must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Timeout monitor period.
    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }
}
