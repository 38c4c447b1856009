use parking_lot::Mutex;
use reclaim_traits::{MemoryProbe, MemoryReading, ProbeError};

/// Reads machine-wide memory from the operating system.
///
/// Linux only: `MemTotal` and `MemAvailable` from `/proc/meminfo`. Other
/// platforms report [`ProbeError::Unavailable`], which the monitor turns into
/// its conservative fallback sample.
#[derive(Debug, Default, Clone)]
pub struct SystemMemoryProbe;

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self
    }

    /// Parse the contents of a `/proc/meminfo` style document.
    pub fn parse_meminfo(contents: &str) -> Result<MemoryReading, ProbeError> {
        let mut total_kb = None;
        let mut available_kb = None;
        let mut free_kb = None;

        for line in contents.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let slot = match key {
                "MemTotal:" => &mut total_kb,
                "MemAvailable:" => &mut available_kb,
                "MemFree:" => &mut free_kb,
                _ => continue,
            };
            let kb = value
                .parse::<u64>()
                .map_err(|e| ProbeError::Parse(format!("{key} {value}: {e}")))?;
            *slot = Some(kb);
        }

        let total_kb =
            total_kb.ok_or_else(|| ProbeError::Parse("MemTotal missing".to_string()))?;
        // Kernels before 3.14 have no MemAvailable.
        let available_kb = available_kb
            .or(free_kb)
            .ok_or_else(|| ProbeError::Parse("MemAvailable missing".to_string()))?;

        let total_bytes = total_kb * 1024;
        let available_bytes = (available_kb * 1024).min(total_bytes);
        Ok(MemoryReading {
            total_bytes,
            used_bytes: total_bytes - available_bytes,
            available_bytes,
        })
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn read(&self) -> Result<MemoryReading, ProbeError> {
        #[cfg(target_os = "linux")]
        {
            let contents = std::fs::read_to_string("/proc/meminfo")?;
            Self::parse_meminfo(&contents)
        }

        #[cfg(not(target_os = "linux"))]
        {
            Err(ProbeError::Unavailable(
                "system memory probing is only supported on Linux".to_string(),
            ))
        }
    }

    fn name(&self) -> &str {
        "system"
    }
}

/// Probe with externally controlled readings.
///
/// Used by tests and load simulations to drive the monitor through pressure
/// levels deterministically.
#[derive(Debug)]
pub struct ManualMemoryProbe {
    state: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    reading: MemoryReading,
    fail: bool,
}

impl ManualMemoryProbe {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            state: Mutex::new(ManualState {
                reading: MemoryReading::from_used(total_bytes, 0),
                fail: false,
            }),
        }
    }

    /// Convenience: a probe already reporting `percentage` usage.
    pub fn at_percentage(percentage: f64) -> Self {
        let probe = Self::new(1024 * 1024 * 1024);
        probe.set_percentage(percentage);
        probe
    }

    pub fn set_used(&self, used_bytes: u64) {
        let mut state = self.state.lock();
        state.reading = MemoryReading::from_used(state.reading.total_bytes, used_bytes);
    }

    pub fn set_percentage(&self, percentage: f64) {
        let mut state = self.state.lock();
        let total = state.reading.total_bytes;
        let used = (total as f64 * percentage.clamp(0.0, 100.0) / 100.0).round() as u64;
        state.reading = MemoryReading::from_used(total, used);
    }

    /// Make subsequent reads fail until cleared.
    pub fn set_failing(&self, fail: bool) {
        self.state.lock().fail = fail;
    }
}

impl MemoryProbe for ManualMemoryProbe {
    fn read(&self) -> Result<MemoryReading, ProbeError> {
        let state = self.state.lock();
        if state.fail {
            return Err(ProbeError::Unavailable("manual probe set to fail".to_string()));
        }
        Ok(state.reading)
    }

    fn name(&self) -> &str {
        "manual"
    }
}
