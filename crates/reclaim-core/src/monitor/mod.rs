//! Memory sampling and pressure classification.
//!
//! [`MemoryMonitor`] wraps a [`MemoryProbe`], keeps a bounded history of
//! samples and broadcasts a [`PressureEvent`] whenever the classified level
//! changes. A probe failure never surfaces as an error: the monitor records a
//! conservative fallback sample instead, so everything gated on pressure
//! backs off rather than pressing ahead blind.

mod probe;
mod stats;

pub use probe::{ManualMemoryProbe, SystemMemoryProbe};
pub use stats::{MemoryStats, PressureEvent, PressureLevel, PressureThresholds};

use parking_lot::Mutex;
use reclaim_traits::MemoryProbe;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Memory monitor configuration.
#[derive(Clone, Debug)]
pub struct MonitorConfig {
    pub thresholds: PressureThresholds,
    /// Maximum retained samples.
    pub history_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: PressureThresholds::default(),
            history_size: 120,
        }
    }
}

struct MonitorState {
    history: VecDeque<MemoryStats>,
    level: Option<PressureLevel>,
}

/// Samples memory and classifies pressure.
pub struct MemoryMonitor {
    probe: Arc<dyn MemoryProbe>,
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<PressureEvent>,
}

impl MemoryMonitor {
    pub fn new(probe: Arc<dyn MemoryProbe>, config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let history_size = config.history_size.max(1);
        Self {
            probe,
            config: MonitorConfig {
                history_size,
                ..config
            },
            state: Mutex::new(MonitorState {
                history: VecDeque::with_capacity(history_size),
                level: None,
            }),
            events,
        }
    }

    pub fn thresholds(&self) -> &PressureThresholds {
        &self.config.thresholds
    }

    /// Take a sample, record it and return it.
    pub fn sample(&self) -> MemoryStats {
        let stats = match self.probe.read() {
            Ok(reading) => MemoryStats::from_reading(reading, &self.config.thresholds),
            Err(e) => {
                let last_total = self.latest().map(|s| s.total_bytes);
                let fallback = MemoryStats::fallback(&self.config.thresholds, last_total);
                warn!(
                    probe = self.probe.name(),
                    error = %e,
                    fallback_level = %fallback.pressure_level,
                    "Memory measurement failed, assuming elevated pressure"
                );
                fallback
            }
        };

        self.record(stats.clone());
        stats
    }

    /// Sample on the blocking pool.
    pub async fn sample_async(self: &Arc<Self>) -> MemoryStats {
        let monitor = self.clone();
        match tokio::task::spawn_blocking(move || monitor.sample()).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Memory sampling task failed");
                let last_total = self.latest().map(|s| s.total_bytes);
                let fallback = MemoryStats::fallback(&self.config.thresholds, last_total);
                self.record(fallback.clone());
                fallback
            }
        }
    }

    /// Fresh pressure classification.
    pub fn pressure_level(&self) -> PressureLevel {
        self.sample().pressure_level
    }

    /// Level of the most recent sample, without measuring again.
    pub fn last_level(&self) -> Option<PressureLevel> {
        self.state.lock().level
    }

    pub fn latest(&self) -> Option<MemoryStats> {
        self.state.lock().history.back().cloned()
    }

    /// Up to `limit` most recent samples, oldest first.
    pub fn history(&self, limit: usize) -> std::vec::IntoIter<MemoryStats> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state
            .history
            .iter()
            .skip(skip)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Mean usage percentage over the last `window` samples.
    pub fn average_usage(&self, window: usize) -> Option<f64> {
        let samples: Vec<f64> = self.history(window).map(|s| s.percentage_used).collect();
        if samples.is_empty() {
            return None;
        }
        Some(samples.iter().sum::<f64>() / samples.len() as f64)
    }

    /// Highest usage percentage still in history.
    pub fn peak_usage(&self) -> Option<f64> {
        self.state
            .lock()
            .history
            .iter()
            .map(|s| s.percentage_used)
            .reduce(f64::max)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PressureEvent> {
        self.events.subscribe()
    }

    /// Spawn the fixed-interval sampler.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Memory sampler started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let stats = monitor.sample_async().await;
                        debug!(
                            percentage = stats.percentage_used,
                            level = %stats.pressure_level,
                            "Memory sample"
                        );
                    }
                }
            }
            info!("Memory sampler stopped");
        })
    }

    fn record(&self, stats: MemoryStats) {
        let event = {
            let mut state = self.state.lock();
            if state.history.len() >= self.config.history_size {
                state.history.pop_front();
            }
            state.history.push_back(stats.clone());

            let previous = state.level;
            state.level = Some(stats.pressure_level);
            (previous != Some(stats.pressure_level)).then(|| PressureEvent {
                previous,
                current: stats.pressure_level,
                stats,
            })
        };

        if let Some(event) = event {
            if event.current >= PressureLevel::High {
                warn!(
                    previous = ?event.previous,
                    current = %event.current,
                    percentage = event.stats.percentage_used,
                    "Memory pressure changed"
                );
            } else {
                info!(
                    previous = ?event.previous,
                    current = %event.current,
                    percentage = event.stats.percentage_used,
                    "Memory pressure changed"
                );
            }
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_with(probe: Arc<ManualMemoryProbe>, history_size: usize) -> MemoryMonitor {
        MemoryMonitor::new(
            probe,
            MonitorConfig {
                history_size,
                ..Default::default()
            },
        )
    }

    #[test]
    fn classification_boundaries() {
        let cases = [
            (0.0, PressureLevel::Low),
            (69.999, PressureLevel::Low),
            (70.0, PressureLevel::Moderate),
            (79.999, PressureLevel::Moderate),
            (80.0, PressureLevel::High),
            (89.999, PressureLevel::High),
            (90.0, PressureLevel::Critical),
            (100.0, PressureLevel::Critical),
        ];
        for (percentage, expected) in cases {
            assert_eq!(
                PressureLevel::from_percentage(percentage),
                expected,
                "percentage {percentage}"
            );
        }
    }

    #[test]
    fn custom_thresholds_shift_boundaries() {
        let thresholds = PressureThresholds {
            moderate: 60.0,
            high: 75.0,
            critical: 85.0,
        };
        assert_eq!(thresholds.classify(74.9), PressureLevel::Moderate);
        assert_eq!(thresholds.classify(75.0), PressureLevel::High);
        assert_eq!(thresholds.classify(85.0), PressureLevel::Critical);
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let probe = Arc::new(ManualMemoryProbe::at_percentage(10.0));
        let monitor = monitor_with(probe.clone(), 3);

        for pct in [10.0, 20.0, 30.0, 40.0, 50.0] {
            probe.set_percentage(pct);
            monitor.sample();
        }

        let all: Vec<f64> = monitor
            .history(10)
            .map(|s| s.percentage_used.round())
            .collect();
        assert_eq!(all, vec![30.0, 40.0, 50.0]);

        let last_two: Vec<f64> = monitor
            .history(2)
            .map(|s| s.percentage_used.round())
            .collect();
        assert_eq!(last_two, vec![40.0, 50.0]);
        assert_eq!(monitor.peak_usage().map(f64::round), Some(50.0));
        assert_eq!(monitor.average_usage(2).map(f64::round), Some(45.0));
    }

    #[test]
    fn probe_failure_yields_conservative_fallback() {
        let probe = Arc::new(ManualMemoryProbe::at_percentage(20.0));
        let monitor = monitor_with(probe.clone(), 10);
        let healthy = monitor.sample();
        assert_eq!(healthy.pressure_level, PressureLevel::Low);

        probe.set_failing(true);
        let fallback = monitor.sample();
        assert!(fallback.estimated);
        assert_eq!(fallback.pressure_level, PressureLevel::High);
        assert_eq!(fallback.total_bytes, healthy.total_bytes);
        assert_eq!(monitor.pressure_level(), PressureLevel::High);
    }

    #[tokio::test]
    async fn level_changes_are_broadcast() {
        let probe = Arc::new(ManualMemoryProbe::at_percentage(50.0));
        let monitor = monitor_with(probe.clone(), 10);
        let mut events = monitor.subscribe();

        monitor.sample();
        let first = events.recv().await.unwrap();
        assert_eq!(first.previous, None);
        assert_eq!(first.current, PressureLevel::Low);

        // Same level again publishes nothing.
        monitor.sample();
        probe.set_percentage(92.0);
        monitor.sample();

        let second = events.recv().await.unwrap();
        assert_eq!(second.previous, Some(PressureLevel::Low));
        assert_eq!(second.current, PressureLevel::Critical);
        assert!(second.is_escalation());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn sampler_stops_on_cancel() {
        let probe = Arc::new(ManualMemoryProbe::at_percentage(30.0));
        let monitor = Arc::new(monitor_with(probe, 50));
        let cancel = CancellationToken::new();

        let handle = monitor.spawn_sampler(Duration::from_millis(20), cancel.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sampler should stop within one interval")
            .unwrap();

        let samples = monitor.history(100).count();
        assert!(samples >= 3, "expected at least 3 samples, got {samples}");
    }
}
