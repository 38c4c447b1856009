use chrono::{DateTime, Utc};
use reclaim_traits::MemoryReading;
use serde::Serialize;

/// Memory pressure classification.
///
/// Ordered from least to most severe so callers can write
/// `level >= PressureLevel::High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Low = 0,
    Moderate = 1,
    High = 2,
    Critical = 3,
}

impl PressureLevel {
    /// Classify with the default 70/80/90 boundaries.
    pub fn from_percentage(percentage_used: f64) -> Self {
        PressureThresholds::default().classify(percentage_used)
    }

    /// Whether expensive work should be held back.
    pub fn should_defer(&self) -> bool {
        *self >= PressureLevel::High
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Low => "low",
            PressureLevel::Moderate => "moderate",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower bounds (inclusive, in percent) of each elevated pressure level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub moderate: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            moderate: 70.0,
            high: 80.0,
            critical: 90.0,
        }
    }
}

impl PressureThresholds {
    pub fn classify(&self, percentage_used: f64) -> PressureLevel {
        if percentage_used >= self.critical {
            PressureLevel::Critical
        } else if percentage_used >= self.high {
            PressureLevel::High
        } else if percentage_used >= self.moderate {
            PressureLevel::Moderate
        } else {
            PressureLevel::Low
        }
    }
}

/// Immutable memory snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub percentage_used: f64,
    pub pressure_level: PressureLevel,
    pub timestamp: DateTime<Utc>,
    /// True when the probe failed and this is a substituted value.
    pub estimated: bool,
}

impl MemoryStats {
    pub fn from_reading(reading: MemoryReading, thresholds: &PressureThresholds) -> Self {
        let percentage_used = reading.percentage_used();
        Self {
            total_bytes: reading.total_bytes,
            used_bytes: reading.used_bytes,
            available_bytes: reading.available_bytes,
            percentage_used,
            pressure_level: thresholds.classify(percentage_used),
            timestamp: Utc::now(),
            estimated: false,
        }
    }

    /// Conservative stand-in used when measurement fails.
    ///
    /// Sits exactly on the high threshold so gated operations back off.
    pub fn fallback(thresholds: &PressureThresholds, last_total: Option<u64>) -> Self {
        let percentage_used = thresholds.high;
        let total_bytes = last_total.unwrap_or(0);
        let used_bytes = (total_bytes as f64 * percentage_used / 100.0) as u64;
        Self {
            total_bytes,
            used_bytes,
            available_bytes: total_bytes.saturating_sub(used_bytes),
            percentage_used,
            pressure_level: thresholds.classify(percentage_used),
            timestamp: Utc::now(),
            estimated: true,
        }
    }
}

/// Published whenever the sampled pressure level changes.
#[derive(Debug, Clone)]
pub struct PressureEvent {
    pub previous: Option<PressureLevel>,
    pub current: PressureLevel,
    pub stats: MemoryStats,
}

impl PressureEvent {
    pub fn is_escalation(&self) -> bool {
        self.previous.is_none_or(|previous| self.current > previous)
    }
}
