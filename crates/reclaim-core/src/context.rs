//! Composition root for the lifecycle core.
//!
//! A [`LifecycleContext`] is built once at startup and passed by reference to
//! whatever needs it. It owns the monitor, the request handle pool, the
//! component registry and the scope and session managers, runs their
//! background tasks, and tears everything down in order on shutdown.

use anyhow::Result;
use futures::future::join_all;
use parking_lot::Mutex;
use reclaim_traits::MemoryProbe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::components::{ComponentPriority, LazyComponentRegistry, PreloadReport, RegistryConfig};
use crate::config::LifecycleConfig;
use crate::monitor::{MemoryMonitor, MonitorConfig, PressureLevel, SystemMemoryProbe};
use crate::pool::{ObjectPool, PoolConfig, RequestHandle};
use crate::scope::RequestScopeManager;
use crate::session::{SessionConfig, SessionLifecycleManager};

/// What one pressure fan-out released.
#[derive(Debug, Clone, Default)]
pub struct PressureResponse {
    pub level: Option<PressureLevel>,
    pub components: Vec<String>,
    pub sessions: Vec<String>,
    pub pool_trimmed: usize,
}

/// What shutdown disposed.
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    pub sessions: usize,
    pub scopes: usize,
    pub components: Vec<String>,
}

pub struct LifecycleContext {
    config: LifecycleConfig,
    monitor: Arc<MemoryMonitor>,
    pool: ObjectPool<RequestHandle>,
    registry: Arc<LazyComponentRegistry>,
    scopes: RequestScopeManager,
    sessions: SessionLifecycleManager,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl LifecycleContext {
    /// Validate `config` and build every component.
    pub fn new(config: LifecycleConfig, probe: Arc<dyn MemoryProbe>) -> Result<Self> {
        config.validate()?;

        let monitor = Arc::new(MemoryMonitor::new(
            probe,
            MonitorConfig {
                thresholds: config.thresholds(),
                history_size: config.history_size,
            },
        ));
        let pool = ObjectPool::new(PoolConfig {
            name: "request-handles".to_string(),
            initial_size: config.pool_initial_size,
            max_size: config.pool_max_size,
            reuse_timeout: config.pool_reuse_timeout(),
        });
        let registry = Arc::new(LazyComponentRegistry::new(
            Some(monitor.clone()),
            RegistryConfig {
                load_timeout: config.component_load_timeout(),
                deferral_cost_threshold_mb: config.deferral_cost_threshold_mb,
            },
        ));
        let cancel = CancellationToken::new();
        let sessions = SessionLifecycleManager::new(
            SessionConfig {
                session_timeout: config.session_timeout(),
                idle_timeout: config.idle_timeout(),
                disconnect_grace: config.disconnect_grace(),
            },
            cancel.child_token(),
        );

        Ok(Self {
            config,
            monitor,
            pool,
            registry,
            scopes: RequestScopeManager::new(),
            sessions,
            cancel,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Build a context that reads memory from the operating system.
    pub fn with_system_probe(config: LifecycleConfig) -> Result<Self> {
        Self::new(config, Arc::new(SystemMemoryProbe::new()))
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<MemoryMonitor> {
        &self.monitor
    }

    pub fn pool(&self) -> &ObjectPool<RequestHandle> {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<LazyComponentRegistry> {
        &self.registry
    }

    pub fn scopes(&self) -> &RequestScopeManager {
        &self.scopes
    }

    pub fn sessions(&self) -> &SessionLifecycleManager {
        &self.sessions
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load Immediate components and spawn the background tasks.
    ///
    /// Calling it twice is a no-op that returns an empty report.
    pub async fn start(&self) -> PreloadReport {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("Lifecycle context already started");
            return PreloadReport::default();
        }

        let report = self.registry.initialize().await;
        if !report.failed.is_empty() {
            warn!(failed = report.failed.len(), "Some startup components failed to load");
        }

        let mut tasks = Vec::new();
        if self.config.monitoring_enabled {
            tasks.push(
                self.monitor
                    .spawn_sampler(self.config.sample_interval(), self.cancel.child_token()),
            );
            tasks.push(self.spawn_pressure_listener());
        }
        if self.config.cleanup_enabled {
            tasks.push(
                self.sessions
                    .spawn_sweeper(self.config.cleanup_interval(), self.cancel.child_token()),
            );
            tasks.push(self.scopes.spawn_sweeper(
                self.config.cleanup_interval(),
                self.config.scope_max_age(),
                self.cancel.child_token(),
            ));
        }
        tasks.push(
            self.pool
                .spawn_reclaimer(self.config.pool_reclaim_interval(), self.cancel.child_token()),
        );
        tasks.push(
            self.registry
                .spawn_preloader(self.config.preload_delay(), self.cancel.child_token()),
        );

        info!(
            tasks = tasks.len(),
            immediate_components = report.loaded.len(),
            monitoring = self.config.monitoring_enabled,
            cleanup = self.config.cleanup_enabled,
            "Lifecycle context started"
        );
        self.tasks.lock().extend(tasks);
        report
    }

    /// Shed load across every component for `level`.
    pub async fn handle_pressure(&self, level: PressureLevel) -> PressureResponse {
        handle_pressure(&self.registry, &self.sessions, &self.pool, level).await
    }

    /// Dispose sessions, then scopes, then stop background tasks and unload
    /// whatever components are still loaded.
    pub async fn shutdown(&self) -> ShutdownReport {
        info!("Lifecycle context shutting down");
        let sessions = self.sessions.dispose_all().await;
        let scopes = self.scopes.dispose_all().await;

        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        let components = self
            .registry
            .unload_by_priority(ComponentPriority::Critical)
            .await;
        info!(
            sessions,
            scopes,
            components = components.len(),
            "Lifecycle context stopped"
        );
        ShutdownReport {
            sessions,
            scopes,
            components,
        }
    }

    fn spawn_pressure_listener(&self) -> JoinHandle<()> {
        let mut events = self.monitor.subscribe();
        let registry = self.registry.clone();
        let sessions = self.sessions.clone();
        let pool = self.pool.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) if event.current >= PressureLevel::High => {
                            handle_pressure(&registry, &sessions, &pool, event.current).await;
                        }
                        Ok(event) => {
                            debug!(level = %event.current, "Pressure eased");
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Pressure listener lagged behind");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Pressure listener stopped");
        })
    }
}

async fn handle_pressure(
    registry: &LazyComponentRegistry,
    sessions: &SessionLifecycleManager,
    pool: &ObjectPool<RequestHandle>,
    level: PressureLevel,
) -> PressureResponse {
    if level < PressureLevel::High {
        return PressureResponse::default();
    }

    let components = registry.handle_pressure(level).await;
    let sessions = sessions.handle_pressure(level).await;
    let pool_trimmed = pool.shrink_idle(pool.config().initial_size);
    warn!(
        level = %level,
        components = components.len(),
        sessions = sessions.len(),
        pool_trimmed,
        "Memory pressure response"
    );
    PressureResponse {
        level: Some(level),
        components,
        sessions,
        pool_trimmed,
    }
}
