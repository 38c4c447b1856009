//! Memory query abstraction.
//!
//! The lifecycle core never measures memory directly. It asks a
//! [`MemoryProbe`], which lets the host decide whether "memory" means the
//! whole machine, a cgroup budget, or a synthetic figure in tests.

use thiserror::Error;

/// Raw figures returned by a probe, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

impl MemoryReading {
    /// Build a reading from total and used bytes.
    pub fn from_used(total_bytes: u64, used_bytes: u64) -> Self {
        let used_bytes = used_bytes.min(total_bytes);
        Self {
            total_bytes,
            used_bytes,
            available_bytes: total_bytes - used_bytes,
        }
    }

    /// Percentage of total capacity in use, in `[0, 100]`.
    pub fn percentage_used(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// Failure to obtain a memory reading.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Memory source unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to parse memory source: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Process or system memory query.
///
/// Implementations may block briefly (reading `/proc`, calling sysctl), so
/// callers run them off the async scheduler.
pub trait MemoryProbe: Send + Sync {
    /// Take one reading.
    fn read(&self) -> Result<MemoryReading, ProbeError>;

    /// Short label used in logs.
    fn name(&self) -> &str {
        "memory-probe"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_handles_zero_total() {
        let reading = MemoryReading::from_used(0, 0);
        assert_eq!(reading.percentage_used(), 0.0);
    }

    #[test]
    fn from_used_clamps_to_total() {
        let reading = MemoryReading::from_used(100, 250);
        assert_eq!(reading.used_bytes, 100);
        assert_eq!(reading.available_bytes, 0);
        assert_eq!(reading.percentage_used(), 100.0);
    }
}
