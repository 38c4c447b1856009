//! Lifecycle configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::monitor::PressureThresholds;

// Default configuration constants
const DEFAULT_SAMPLE_INTERVAL_SECONDS: f64 = 30.0;
const DEFAULT_MODERATE_THRESHOLD_PERCENT: f64 = 70.0;
const DEFAULT_WARNING_THRESHOLD_PERCENT: f64 = 80.0;
const DEFAULT_CRITICAL_THRESHOLD_PERCENT: f64 = 90.0;
const DEFAULT_HISTORY_SIZE: usize = 120;
const DEFAULT_POOL_INITIAL_SIZE: usize = 10;
const DEFAULT_POOL_MAX_SIZE: usize = 100;
const DEFAULT_POOL_REUSE_TIMEOUT_SECONDS: f64 = 300.0; // 5 minutes
const DEFAULT_POOL_RECLAIM_INTERVAL_SECONDS: f64 = 60.0;
const DEFAULT_SESSION_TIMEOUT_SECONDS: f64 = 3600.0; // 1 hour
const DEFAULT_IDLE_TIMEOUT_SECONDS: f64 = 300.0; // 5 minutes
const DEFAULT_CLEANUP_INTERVAL_SECONDS: f64 = 60.0;
const DEFAULT_DISCONNECT_GRACE_SECONDS: f64 = 30.0;
const DEFAULT_SCOPE_MAX_AGE_SECONDS: f64 = 300.0;
const DEFAULT_COMPONENT_LOAD_TIMEOUT_SECONDS: f64 = 30.0;
const DEFAULT_DEFERRAL_COST_THRESHOLD_MB: f64 = 5.0;
const DEFAULT_PRELOAD_DELAY_SECONDS: f64 = 2.0;
const MIN_HISTORY_SIZE: usize = 1;

/// Runtime options for every lifecycle component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub monitoring_enabled: bool,
    pub sample_interval_seconds: f64,
    pub moderate_threshold_percent: f64,
    pub warning_threshold_percent: f64,
    pub critical_threshold_percent: f64,
    pub history_size: usize,
    pub cleanup_enabled: bool,
    pub pool_initial_size: usize,
    pub pool_max_size: usize,
    pub pool_reuse_timeout_seconds: f64,
    pub pool_reclaim_interval_seconds: f64,
    pub session_timeout_seconds: f64,
    pub idle_timeout_seconds: f64,
    pub cleanup_interval_seconds: f64,
    pub disconnect_grace_seconds: f64,
    pub scope_max_age_seconds: f64,
    pub component_load_timeout_seconds: f64,
    pub deferral_cost_threshold_mb: f64,
    pub preload_delay_seconds: f64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            monitoring_enabled: true,
            sample_interval_seconds: DEFAULT_SAMPLE_INTERVAL_SECONDS,
            moderate_threshold_percent: DEFAULT_MODERATE_THRESHOLD_PERCENT,
            warning_threshold_percent: DEFAULT_WARNING_THRESHOLD_PERCENT,
            critical_threshold_percent: DEFAULT_CRITICAL_THRESHOLD_PERCENT,
            history_size: DEFAULT_HISTORY_SIZE,
            cleanup_enabled: true,
            pool_initial_size: DEFAULT_POOL_INITIAL_SIZE,
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            pool_reuse_timeout_seconds: DEFAULT_POOL_REUSE_TIMEOUT_SECONDS,
            pool_reclaim_interval_seconds: DEFAULT_POOL_RECLAIM_INTERVAL_SECONDS,
            session_timeout_seconds: DEFAULT_SESSION_TIMEOUT_SECONDS,
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
            cleanup_interval_seconds: DEFAULT_CLEANUP_INTERVAL_SECONDS,
            disconnect_grace_seconds: DEFAULT_DISCONNECT_GRACE_SECONDS,
            scope_max_age_seconds: DEFAULT_SCOPE_MAX_AGE_SECONDS,
            component_load_timeout_seconds: DEFAULT_COMPONENT_LOAD_TIMEOUT_SECONDS,
            deferral_cost_threshold_mb: DEFAULT_DEFERRAL_COST_THRESHOLD_MB,
            preload_delay_seconds: DEFAULT_PRELOAD_DELAY_SECONDS,
        }
    }
}

impl LifecycleConfig {
    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Invalid lifecycle config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let moderate = self.moderate_threshold_percent;
        let warning = self.warning_threshold_percent;
        let critical = self.critical_threshold_percent;
        if !(moderate > 0.0 && moderate < warning && warning < critical && critical <= 100.0) {
            return Err(anyhow::anyhow!(
                "Pressure thresholds must satisfy 0 < moderate < warning < critical <= 100 (got {}/{}/{})",
                moderate,
                warning,
                critical
            ));
        }

        for (name, value) in [
            ("sample_interval_seconds", self.sample_interval_seconds),
            ("pool_reuse_timeout_seconds", self.pool_reuse_timeout_seconds),
            (
                "pool_reclaim_interval_seconds",
                self.pool_reclaim_interval_seconds,
            ),
            ("session_timeout_seconds", self.session_timeout_seconds),
            ("idle_timeout_seconds", self.idle_timeout_seconds),
            ("cleanup_interval_seconds", self.cleanup_interval_seconds),
            ("scope_max_age_seconds", self.scope_max_age_seconds),
            (
                "component_load_timeout_seconds",
                self.component_load_timeout_seconds,
            ),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(anyhow::anyhow!("{} must be greater than 0", name));
            }
        }

        for (name, value) in [
            ("disconnect_grace_seconds", self.disconnect_grace_seconds),
            ("preload_delay_seconds", self.preload_delay_seconds),
            ("deferral_cost_threshold_mb", self.deferral_cost_threshold_mb),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(anyhow::anyhow!("{} must not be negative", name));
            }
        }

        if self.history_size < MIN_HISTORY_SIZE {
            return Err(anyhow::anyhow!(
                "History size must be at least {}",
                MIN_HISTORY_SIZE
            ));
        }

        if self.pool_max_size == 0 {
            return Err(anyhow::anyhow!("Pool max size must be at least 1"));
        }

        if self.pool_initial_size > self.pool_max_size {
            return Err(anyhow::anyhow!(
                "Pool initial size ({}) exceeds max size ({})",
                self.pool_initial_size,
                self.pool_max_size
            ));
        }

        if self.idle_timeout_seconds >= self.session_timeout_seconds {
            return Err(anyhow::anyhow!(
                "Idle timeout must be shorter than session timeout"
            ));
        }

        Ok(())
    }

    pub fn thresholds(&self) -> PressureThresholds {
        PressureThresholds {
            moderate: self.moderate_threshold_percent,
            high: self.warning_threshold_percent,
            critical: self.critical_threshold_percent,
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs_f64(self.sample_interval_seconds)
    }

    pub fn pool_reuse_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pool_reuse_timeout_seconds)
    }

    pub fn pool_reclaim_interval(&self) -> Duration {
        Duration::from_secs_f64(self.pool_reclaim_interval_seconds)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.session_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs_f64(self.cleanup_interval_seconds)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_secs_f64(self.disconnect_grace_seconds)
    }

    pub fn scope_max_age(&self) -> Duration {
        Duration::from_secs_f64(self.scope_max_age_seconds)
    }

    pub fn component_load_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.component_load_timeout_seconds)
    }

    pub fn preload_delay(&self) -> Duration {
        Duration::from_secs_f64(self.preload_delay_seconds)
    }
}
