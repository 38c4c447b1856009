use serde::Serialize;
use std::time::Duration;

/// Raw counters, mutated only under the pool lock.
#[derive(Debug, Default)]
pub(super) struct PoolCounters {
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_created: u64,
    pub hits: u64,
    pub misses: u64,
    pub overflow_created: u64,
    pub reclaimed: u64,
    pub discarded: u64,
    pub peak_active: usize,
    pub total_acquire_time_ns: u128,
}

impl PoolCounters {
    pub fn snapshot(&self, current_active: usize, current_pooled: usize) -> PoolStatistics {
        PoolStatistics {
            total_acquired: self.total_acquired,
            total_released: self.total_released,
            total_created: self.total_created,
            current_active,
            current_pooled,
            peak_active: self.peak_active,
            avg_acquisition_latency: self.avg_acquisition_latency(),
            cache_hit_rate: self.cache_hit_rate(),
            overflow_created: self.overflow_created,
            reclaimed: self.reclaimed,
            discarded: self.discarded,
        }
    }

    fn avg_acquisition_latency(&self) -> Duration {
        if self.total_acquired == 0 {
            return Duration::ZERO;
        }
        let avg = self.total_acquire_time_ns / self.total_acquired as u128;
        Duration::from_nanos(avg.min(u64::MAX as u128) as u64)
    }

    fn cache_hit_rate(&self) -> f64 {
        if self.total_acquired > 0 {
            self.hits as f64 / self.total_acquired as f64
        } else {
            0.0
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatistics {
    pub total_acquired: u64,
    pub total_released: u64,
    pub total_created: u64,
    pub current_active: usize,
    pub current_pooled: usize,
    pub peak_active: usize,
    pub avg_acquisition_latency: Duration,
    pub cache_hit_rate: f64,
    pub overflow_created: u64,
    pub reclaimed: u64,
    pub discarded: u64,
}
