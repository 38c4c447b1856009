//! Bounded FIFO pool for short-lived handles.
//!
//! Acquisition never waits: when the pool is at capacity it hands out an
//! overflow instance that is dropped on release instead of being recycled.
//! Handles held past the reuse timeout are reclaimed as abandoned; their
//! bookkeeping is released and the instance is discarded whenever the holder
//! finally lets go of it.

mod handle;
mod stats;

pub use handle::{Poolable, RequestHandle, RequestHandleInit};
pub use stats::PoolStatistics;

use parking_lot::Mutex;
use stats::PoolCounters;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Object pool configuration.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Label used in logs.
    pub name: String,
    /// Idle instances created up front.
    pub initial_size: usize,
    /// Upper bound on active + idle instances.
    pub max_size: usize,
    /// Active handles older than this are treated as abandoned.
    pub reuse_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            initial_size: 10,
            max_size: 100,
            reuse_timeout: Duration::from_secs(300),
        }
    }
}

struct ActiveEntry {
    acquired_at: Instant,
    revoked: Arc<AtomicBool>,
}

struct PoolState<T> {
    idle: VecDeque<T>,
    active: HashMap<u64, ActiveEntry>,
    counters: PoolCounters,
}

struct PoolShared<T> {
    config: PoolConfig,
    state: Mutex<PoolState<T>>,
    next_id: AtomicU64,
}

/// Generic handle pool. Cloning shares the same pool.
pub struct ObjectPool<T: Poolable> {
    shared: Arc<PoolShared<T>>,
}

impl<T: Poolable> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new(config: PoolConfig) -> Self {
        let max_size = config.max_size.max(1);
        let initial = config.initial_size.min(max_size);

        let mut idle = VecDeque::with_capacity(max_size);
        for _ in 0..initial {
            idle.push_back(T::create());
        }

        let counters = PoolCounters {
            total_created: initial as u64,
            ..Default::default()
        };

        Self {
            shared: Arc::new(PoolShared {
                config: PoolConfig { max_size, ..config },
                state: Mutex::new(PoolState {
                    idle,
                    active: HashMap::new(),
                    counters,
                }),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Take an initialized instance. Never blocks, never fails.
    pub fn acquire(&self, args: T::Init) -> Pooled<T> {
        let started = Instant::now();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let revoked = Arc::new(AtomicBool::new(false));

        let (value, overflow) = {
            let mut state = self.shared.state.lock();
            let max_size = self.shared.config.max_size;

            let slot = if let Some(value) = state.idle.pop_front() {
                state.counters.hits += 1;
                Some(value)
            } else if state.active.len() + state.idle.len() < max_size {
                state.counters.misses += 1;
                state.counters.total_created += 1;
                Some(T::create())
            } else {
                None
            };

            let overflow = slot.is_none();
            let value = match slot {
                Some(value) => {
                    state.active.insert(
                        id,
                        ActiveEntry {
                            acquired_at: started,
                            revoked: revoked.clone(),
                        },
                    );
                    let active = state.active.len();
                    if active > state.counters.peak_active {
                        state.counters.peak_active = active;
                    }
                    value
                }
                None => {
                    state.counters.overflow_created += 1;
                    state.counters.total_created += 1;
                    warn!(
                        pool = %self.shared.config.name,
                        max_size,
                        active = state.active.len(),
                        "Object pool saturated, issuing overflow handle"
                    );
                    T::create()
                }
            };

            state.counters.total_acquired += 1;
            state.counters.total_acquire_time_ns += started.elapsed().as_nanos();
            (value, overflow)
        };

        let mut value = value;
        value.initialize(args);

        Pooled {
            value: Some(value),
            id,
            overflow,
            acquired_at: started,
            revoked,
            pool: Arc::downgrade(&self.shared),
        }
    }

    /// Return a handle explicitly. Equivalent to dropping it.
    pub fn release(&self, handle: Pooled<T>) {
        drop(handle);
    }

    /// Reclaim bookkeeping for handles held past the reuse timeout.
    ///
    /// Reclaimed handles are revoked and will be discarded, never re-pooled,
    /// when their holder releases them.
    pub fn reclaim_abandoned(&self) -> usize {
        let timeout = self.shared.config.reuse_timeout;
        let now = Instant::now();
        let mut state = self.shared.state.lock();

        let expired: Vec<u64> = state
            .active
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.acquired_at) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(entry) = state.active.remove(id) {
                entry.revoked.store(true, Ordering::Release);
            }
        }
        state.counters.reclaimed += expired.len() as u64;

        if !expired.is_empty() {
            warn!(
                pool = %self.shared.config.name,
                count = expired.len(),
                timeout_secs = timeout.as_secs_f64(),
                "Reclaimed abandoned pool handles"
            );
        }
        expired.len()
    }

    /// Drop idle instances until at most `target` remain.
    pub fn shrink_idle(&self, target: usize) -> usize {
        let mut state = self.shared.state.lock();
        let excess = state.idle.len().saturating_sub(target);
        for _ in 0..excess {
            state.idle.pop_back();
        }
        state.counters.discarded += excess as u64;
        if excess > 0 {
            debug!(pool = %self.shared.config.name, dropped = excess, "Shrunk idle pool");
        }
        excess
    }

    pub fn stats(&self) -> PoolStatistics {
        let state = self.shared.state.lock();
        state
            .counters
            .snapshot(state.active.len(), state.idle.len())
    }

    /// Spawn the periodic abandoned-handle reclaimer.
    pub fn spawn_reclaimer(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            info!(pool = %pool.shared.config.name, "Pool reclaimer started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.reclaim_abandoned();
                    }
                }
            }
            info!(pool = %pool.shared.config.name, "Pool reclaimer stopped");
        })
    }
}

impl<T: Poolable> PoolShared<T> {
    fn give_back(&self, id: u64, overflow: bool, mut value: T) {
        value.reset();

        let mut state = self.state.lock();
        state.counters.total_released += 1;

        if overflow {
            state.counters.discarded += 1;
            return;
        }

        if state.active.remove(&id).is_none() {
            // Reclaimed while the holder still had it.
            state.counters.discarded += 1;
            return;
        }

        if state.active.len() + state.idle.len() < self.config.max_size {
            state.idle.push_back(value);
        } else {
            state.counters.discarded += 1;
        }
    }
}

/// An acquired pool instance. Returns itself to the pool when dropped.
pub struct Pooled<T: Poolable> {
    value: Option<T>,
    id: u64,
    overflow: bool,
    acquired_at: Instant,
    revoked: Arc<AtomicBool>,
    pool: Weak<PoolShared<T>>,
}

impl<T: Poolable> Pooled<T> {
    /// Whether this is a temporary instance issued while the pool was full.
    pub fn is_overflow(&self) -> bool {
        self.overflow
    }

    /// Whether the pool reclaimed this handle as abandoned.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl<T: Poolable> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value present until drop")
    }
}

impl<T: Poolable> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value present until drop")
    }
}

impl<T: Poolable> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(value) = self.value.take() else {
            return;
        };
        if let Some(pool) = self.pool.upgrade() {
            pool.give_back(self.id, self.overflow, value);
        }
    }
}

impl<T: Poolable + std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.id)
            .field("overflow", &self.overflow)
            .field("value", &self.value)
            .finish()
    }
}
