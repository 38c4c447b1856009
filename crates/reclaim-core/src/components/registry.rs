use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::definition::{
    ComponentDefinition, ComponentInstance, ComponentPriority, DeferredLoad, LoadOutcome,
    LoadStrategy,
};
use crate::error::{EntityKind, LifecycleError, Result};
use crate::monitor::{MemoryMonitor, PressureLevel};

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Registry configuration.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Upper bound on waiting for another caller's in-flight load.
    pub load_timeout: Duration,
    /// Components costing more than this (MB) are gated on memory pressure.
    pub deferral_cost_threshold_mb: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_secs(30),
            deferral_cost_threshold_mb: 5.0,
        }
    }
}

#[derive(Default)]
struct SlotState {
    instance: Option<ComponentInstance>,
    /// Set while a load or unload owns the slot.
    loading: bool,
    loaded_at: Option<DateTime<Utc>>,
    access_count: u64,
    last_accessed: Option<Instant>,
    last_accessed_at: Option<DateTime<Utc>>,
}

impl SlotState {
    fn touch(&mut self) -> Option<ComponentInstance> {
        let instance = self.instance.clone()?;
        self.access_count += 1;
        self.last_accessed = Some(Instant::now());
        self.last_accessed_at = Some(Utc::now());
        Some(instance)
    }
}

struct ComponentSlot {
    definition: Mutex<Arc<ComponentDefinition>>,
    state: Mutex<SlotState>,
}

impl ComponentSlot {
    fn definition(&self) -> Arc<ComponentDefinition> {
        self.definition.lock().clone()
    }
}

enum Claim {
    Ready(ComponentInstance),
    Claimed,
    InFlight,
}

/// Diagnostic view of one component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentInfo {
    pub name: String,
    pub priority: String,
    pub strategy: String,
    pub dependencies: Vec<String>,
    pub memory_cost_mb: f64,
    pub loaded: bool,
    pub loading: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

/// Aggregate registry counters.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub registered: usize,
    pub loaded: usize,
    pub loading: usize,
    pub estimated_memory_mb: f64,
    pub loads: u64,
    pub unloads: u64,
    pub deferrals: u64,
    pub failures: u64,
}

/// Outcome of a preload or startup pass.
#[derive(Debug, Clone, Default)]
pub struct PreloadReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<String>,
    pub deferred: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// The pass stopped early because pressure was high.
    pub aborted: bool,
}

#[derive(Default)]
struct RegistryCounters {
    loads: AtomicU64,
    unloads: AtomicU64,
    deferrals: AtomicU64,
    failures: AtomicU64,
}

/// On-demand construction and teardown of named components.
///
/// At most one instance of a name is loaded or loading at any time. Loads
/// resolve declared dependencies first and are deferred under high memory
/// pressure unless the component is critical.
pub struct LazyComponentRegistry {
    components: Mutex<HashMap<String, Arc<ComponentSlot>>>,
    monitor: Option<Arc<MemoryMonitor>>,
    config: RegistryConfig,
    memory_mb: Mutex<f64>,
    counters: RegistryCounters,
    preloaded: AtomicBool,
}

impl LazyComponentRegistry {
    pub fn new(monitor: Option<Arc<MemoryMonitor>>, config: RegistryConfig) -> Self {
        Self {
            components: Mutex::new(HashMap::new()),
            monitor,
            config,
            memory_mb: Mutex::new(0.0),
            counters: RegistryCounters::default(),
            preloaded: AtomicBool::new(false),
        }
    }

    /// Register or replace a definition.
    ///
    /// Replacing keeps any loaded instance; the new definition applies from
    /// the next load.
    pub fn register(&self, definition: ComponentDefinition) {
        let name = definition.name.clone();
        let definition = Arc::new(definition);
        let mut components = self.components.lock();
        if let Some(slot) = components.get(&name) {
            *slot.definition.lock() = definition;
            info!(component = %name, "Component definition replaced");
            return;
        }
        components.insert(
            name.clone(),
            Arc::new(ComponentSlot {
                definition: Mutex::new(definition),
                state: Mutex::new(SlotState::default()),
            }),
        );
        debug!(component = %name, "Component registered");
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.lock().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.components.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.slot(name)
            .map(|slot| slot.state.lock().instance.is_some())
            .unwrap_or(false)
    }

    /// Load a component, constructing it and its dependencies if needed.
    pub async fn load(&self, name: &str) -> Result<LoadOutcome> {
        self.load_inner(name, Vec::new()).await
    }

    /// Load and downcast to the concrete component type.
    pub async fn load_as<T>(&self, name: &str) -> Result<LoadOutcome<Arc<T>>>
    where
        T: Send + Sync + 'static,
    {
        match self.load(name).await? {
            LoadOutcome::Ready(instance) => instance
                .into_any()
                .downcast::<T>()
                .map(LoadOutcome::Ready)
                .map_err(|_| LifecycleError::TypeMismatch {
                    name: name.to_string(),
                    expected: std::any::type_name::<T>(),
                }),
            LoadOutcome::Deferred(deferred) => Ok(LoadOutcome::Deferred(deferred)),
        }
    }

    fn load_inner<'a>(
        &'a self,
        name: &'a str,
        chain: Vec<String>,
    ) -> BoxFuture<'a, Result<LoadOutcome>> {
        async move {
            let slot = self.slot(name)?;

            if let Some(instance) = slot.state.lock().touch() {
                return Ok(LoadOutcome::Ready(instance));
            }

            if chain.iter().any(|entry| entry == name) {
                let mut cycle = chain.clone();
                cycle.push(name.to_string());
                return Err(LifecycleError::CircularDependency(cycle.join(" -> ")));
            }

            let deadline = Instant::now() + self.config.load_timeout;
            loop {
                match Self::claim(&slot) {
                    Claim::Ready(instance) => return Ok(LoadOutcome::Ready(instance)),
                    Claim::Claimed => break,
                    Claim::InFlight => {
                        if let Some(instance) = self.wait_for_inflight(name, &slot, deadline).await? {
                            return Ok(LoadOutcome::Ready(instance));
                        }
                        // The in-flight load gave up without an instance; try to claim it ourselves.
                    }
                }
            }

            // We own the loading flag until construction finishes or this future is dropped.
            let claim = scopeguard::guard(slot.clone(), |slot| {
                slot.state.lock().loading = false;
            });

            let definition = slot.definition();
            let mut chain = chain;
            chain.push(name.to_string());

            for dependency in &definition.dependencies {
                if !self.contains(dependency) {
                    warn!(
                        component = %name,
                        dependency = %dependency,
                        "Dependency is not registered, continuing without it"
                    );
                    continue;
                }
                if let LoadOutcome::Deferred(deferred) =
                    self.load_inner(dependency, chain.clone()).await?
                {
                    self.counters.deferrals.fetch_add(1, Ordering::Relaxed);
                    info!(component = %name, dependency = %dependency, "Load deferred by dependency");
                    return Ok(LoadOutcome::Deferred(DeferredLoad {
                        name: name.to_string(),
                        pressure: deferred.pressure,
                        reason: format!("dependency '{}' deferred: {}", dependency, deferred.reason),
                    }));
                }
            }

            if let Some(deferred) = self.check_pressure(&definition).await {
                self.counters.deferrals.fetch_add(1, Ordering::Relaxed);
                info!(
                    component = %name,
                    pressure = %deferred.pressure,
                    cost_mb = definition.memory_cost_mb,
                    "Component load deferred under memory pressure"
                );
                return Ok(LoadOutcome::Deferred(deferred));
            }

            let started = Instant::now();
            let instance = match definition.factory.build().await {
                Ok(instance) => instance,
                Err(source) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(component = %name, error = %source, "Component factory failed");
                    return Err(LifecycleError::LoadFailed {
                        name: name.to_string(),
                        source,
                    });
                }
            };

            {
                let mut state = slot.state.lock();
                state.instance = Some(instance.clone());
                state.loading = false;
                state.loaded_at = Some(Utc::now());
                state.access_count += 1;
                state.last_accessed = Some(Instant::now());
                state.last_accessed_at = state.loaded_at;
            }
            scopeguard::ScopeGuard::into_inner(claim);

            *self.memory_mb.lock() += definition.memory_cost_mb;
            self.counters.loads.fetch_add(1, Ordering::Relaxed);
            info!(
                component = %name,
                cost_mb = definition.memory_cost_mb,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Component loaded"
            );
            Ok(LoadOutcome::Ready(instance))
        }
        .boxed()
    }

    fn claim(slot: &ComponentSlot) -> Claim {
        let mut state = slot.state.lock();
        if let Some(instance) = state.touch() {
            return Claim::Ready(instance);
        }
        if state.loading {
            return Claim::InFlight;
        }
        state.loading = true;
        Claim::Claimed
    }

    /// Poll an in-flight load with bounded backoff.
    ///
    /// `Ok(None)` means the other load finished without an instance.
    async fn wait_for_inflight(
        &self,
        name: &str,
        slot: &ComponentSlot,
        deadline: Instant,
    ) -> Result<Option<ComponentInstance>> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!(component = %name, "Timed out waiting for in-flight load");
                return Err(LifecycleError::LoadTimeout {
                    name: name.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);

            let mut state = slot.state.lock();
            if let Some(instance) = state.touch() {
                return Ok(Some(instance));
            }
            if !state.loading {
                return Ok(None);
            }
        }
    }

    async fn check_pressure(&self, definition: &ComponentDefinition) -> Option<DeferredLoad> {
        if definition.priority == ComponentPriority::Critical
            || definition.memory_cost_mb <= self.config.deferral_cost_threshold_mb
        {
            return None;
        }
        let monitor = self.monitor.as_ref()?;
        let pressure = monitor.sample_async().await.pressure_level;
        if !pressure.should_defer() {
            return None;
        }
        Some(DeferredLoad {
            name: definition.name.clone(),
            pressure,
            reason: format!(
                "estimated cost {:.1} MB exceeds {:.1} MB under {} pressure",
                definition.memory_cost_mb, self.config.deferral_cost_threshold_mb, pressure
            ),
        })
    }

    /// Tear down a loaded component. Returns `false` if it was not loaded.
    ///
    /// Teardown and shutdown run on their own task and finish even if the
    /// caller is cancelled.
    pub async fn unload(&self, name: &str) -> Result<bool> {
        let slot = self.slot(name)?;

        // Hold the loading flag so concurrent loads wait for teardown to finish.
        let instance = {
            let mut state = slot.state.lock();
            if state.loading {
                return Ok(false);
            }
            let Some(instance) = state.instance.take() else {
                return Ok(false);
            };
            state.loading = true;
            state.loaded_at = None;
            instance
        };

        let definition = slot.definition();
        {
            let mut memory = self.memory_mb.lock();
            *memory = (*memory - definition.memory_cost_mb).max(0.0);
        }
        self.counters.unloads.fetch_add(1, Ordering::Relaxed);

        let component = name.to_string();
        let cost_mb = definition.memory_cost_mb;
        let task = tokio::spawn(async move {
            let _claim = scopeguard::guard(slot, |slot| {
                slot.state.lock().loading = false;
            });
            if let Some(teardown) = &definition.teardown
                && let Err(e) = teardown(instance.clone()).await
            {
                warn!(component = %component, error = %e, "Component teardown failed");
            }
            if let Err(e) = instance.shutdown().await {
                warn!(component = %component, error = %e, "Component shutdown failed");
            }
            info!(component = %component, cost_mb, "Component unloaded");
        });
        if let Err(e) = task.await {
            warn!(component = %name, error = %e, "Component unload task failed");
        }
        Ok(true)
    }

    /// Load every Immediate-strategy component.
    pub async fn initialize(&self) -> PreloadReport {
        let mut report = PreloadReport::default();
        for name in self.names_by_priority(|strategy| strategy == LoadStrategy::Immediate) {
            self.load_into_report(&name, &mut report).await;
        }
        report
    }

    /// Preload Preload/Smart components once, most important first.
    pub async fn preload(&self) -> PreloadReport {
        let mut report = PreloadReport::default();
        if self.preloaded.swap(true, Ordering::AcqRel) {
            debug!("Preload already ran");
            return report;
        }

        for name in self.names_by_priority(|strategy| strategy.is_preloaded()) {
            if let Some(monitor) = &self.monitor {
                let pressure = monitor.sample_async().await.pressure_level;
                if pressure >= PressureLevel::High {
                    warn!(pressure = %pressure, "Aborting preload under memory pressure");
                    report.aborted = true;
                    break;
                }
                if pressure >= PressureLevel::Moderate {
                    debug!(component = %name, pressure = %pressure, "Skipping preload");
                    report.skipped.push(name);
                    continue;
                }
            }
            if self.is_loaded(&name) {
                continue;
            }
            self.load_into_report(&name, &mut report).await;
        }

        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            aborted = report.aborted,
            "Preload finished"
        );
        report
    }

    /// Run [`Self::preload`] once after `delay`.
    pub fn spawn_preloader(
        self: &Arc<Self>,
        delay: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = registry.preload() => {}
                    }
                }
            }
        })
    }

    /// Unload every loaded component whose priority is at or below `threshold`.
    ///
    /// Least important first; ties go to the least recently accessed, then name.
    pub async fn unload_by_priority(&self, threshold: ComponentPriority) -> Vec<String> {
        let victims = self.loaded_victims(|definition, _| definition.priority <= threshold);
        self.unload_all(victims).await
    }

    /// Unload OnDemand/Smart components unused for longer than `max_idle`.
    pub async fn unload_idle(&self, max_idle: Duration) -> Vec<String> {
        let victims = self.loaded_victims(|definition, last_accessed| {
            matches!(
                definition.strategy,
                LoadStrategy::OnDemand | LoadStrategy::Smart
            ) && definition.priority != ComponentPriority::Critical
                && last_accessed.is_none_or(|at| at.elapsed() > max_idle)
        });
        self.unload_all(victims).await
    }

    /// Shed components according to the pressure level.
    pub async fn handle_pressure(&self, level: PressureLevel) -> Vec<String> {
        let threshold = match level {
            PressureLevel::Critical => ComponentPriority::Medium,
            PressureLevel::High => ComponentPriority::Low,
            PressureLevel::Moderate | PressureLevel::Low => return Vec::new(),
        };
        let unloaded = self.unload_by_priority(threshold).await;
        if !unloaded.is_empty() {
            warn!(
                pressure = %level,
                count = unloaded.len(),
                components = ?unloaded,
                "Unloaded components under memory pressure"
            );
        }
        unloaded
    }

    pub fn info(&self, name: &str) -> Result<ComponentInfo> {
        let slot = self.slot(name)?;
        let definition = slot.definition();
        let state = slot.state.lock();
        Ok(ComponentInfo {
            name: definition.name.clone(),
            priority: format!("{:?}", definition.priority),
            strategy: format!("{:?}", definition.strategy),
            dependencies: definition.dependencies.clone(),
            memory_cost_mb: definition.memory_cost_mb,
            loaded: state.instance.is_some(),
            loading: state.loading,
            loaded_at: state.loaded_at,
            access_count: state.access_count,
            last_accessed_at: state.last_accessed_at,
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let slots: Vec<Arc<ComponentSlot>> = self.components.lock().values().cloned().collect();
        let mut loaded = 0;
        let mut loading = 0;
        for slot in &slots {
            let state = slot.state.lock();
            if state.instance.is_some() {
                loaded += 1;
            } else if state.loading {
                loading += 1;
            }
        }
        RegistryStats {
            registered: slots.len(),
            loaded,
            loading,
            estimated_memory_mb: *self.memory_mb.lock(),
            loads: self.counters.loads.load(Ordering::Relaxed),
            unloads: self.counters.unloads.load(Ordering::Relaxed),
            deferrals: self.counters.deferrals.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, name: &str) -> Result<Arc<ComponentSlot>> {
        self.components
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| LifecycleError::not_found(EntityKind::Component, name))
    }

    fn names_by_priority(&self, filter: impl Fn(LoadStrategy) -> bool) -> Vec<String> {
        let mut candidates: Vec<(ComponentPriority, String)> = self
            .components
            .lock()
            .values()
            .map(|slot| slot.definition())
            .filter(|definition| filter(definition.strategy))
            .map(|definition| (definition.priority, definition.name.clone()))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        candidates.into_iter().map(|(_, name)| name).collect()
    }

    fn loaded_victims(
        &self,
        select: impl Fn(&ComponentDefinition, Option<Instant>) -> bool,
    ) -> Vec<String> {
        let slots: Vec<Arc<ComponentSlot>> = self.components.lock().values().cloned().collect();
        let mut victims: Vec<(ComponentPriority, Option<Instant>, String)> = slots
            .iter()
            .filter_map(|slot| {
                let definition = slot.definition();
                let state = slot.state.lock();
                if state.instance.is_none() || !select(&definition, state.last_accessed) {
                    return None;
                }
                Some((
                    definition.priority,
                    state.last_accessed,
                    definition.name.clone(),
                ))
            })
            .collect();
        victims.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        victims.into_iter().map(|(_, _, name)| name).collect()
    }

    async fn unload_all(&self, names: Vec<String>) -> Vec<String> {
        let mut unloaded = Vec::new();
        for name in names {
            match self.unload(&name).await {
                Ok(true) => unloaded.push(name),
                Ok(false) => {}
                Err(e) => warn!(component = %name, error = %e, "Failed to unload component"),
            }
        }
        unloaded
    }

    async fn load_into_report(&self, name: &str, report: &mut PreloadReport) {
        match self.load(name).await {
            Ok(LoadOutcome::Ready(_)) => report.loaded.push(name.to_string()),
            Ok(LoadOutcome::Deferred(_)) => report.deferred.push(name.to_string()),
            Err(e) => {
                warn!(component = %name, error = %e, "Component failed to load");
                report.failed.push((name.to_string(), e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{ManualMemoryProbe, MonitorConfig};
    use async_trait::async_trait;
    use reclaim_traits::Component;
    use std::sync::atomic::AtomicUsize;

    type EventLog = Arc<Mutex<Vec<String>>>;

    struct Widget {
        name: String,
        log: EventLog,
    }

    #[async_trait]
    impl Component for Widget {
        async fn shutdown(&self) -> anyhow::Result<()> {
            self.log.lock().push(format!("shutdown:{}", self.name));
            Ok(())
        }
    }

    fn widget(name: &str, log: &EventLog) -> ComponentDefinition {
        let log = log.clone();
        let component = name.to_string();
        ComponentDefinition::new(name, move || {
            log.lock().push(format!("build:{component}"));
            Ok(Widget {
                name: component.clone(),
                log: log.clone(),
            })
        })
    }

    fn registry_at(percentage: f64) -> (LazyComponentRegistry, Arc<ManualMemoryProbe>) {
        let probe = Arc::new(ManualMemoryProbe::at_percentage(percentage));
        let monitor = Arc::new(MemoryMonitor::new(probe.clone(), MonitorConfig::default()));
        (
            LazyComponentRegistry::new(Some(monitor), RegistryConfig::default()),
            probe,
        )
    }

    #[tokio::test]
    async fn expensive_load_is_deferred_under_pressure() {
        let (registry, probe) = registry_at(95.0);
        let log = EventLog::default();
        registry.register(
            widget("cache", &log)
                .with_priority(ComponentPriority::Optional)
                .with_memory_cost(10.0),
        );

        let outcome = registry.load("cache").await.unwrap();
        let deferred = outcome.deferred().expect("load should be deferred");
        assert_eq!(deferred.pressure, PressureLevel::Critical);
        assert!(!registry.is_loaded("cache"));
        assert!(log.lock().is_empty());
        assert_eq!(registry.stats().deferrals, 1);

        probe.set_percentage(40.0);
        assert!(registry.load("cache").await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn critical_and_cheap_components_ignore_pressure() {
        let (registry, _probe) = registry_at(95.0);
        let log = EventLog::default();
        registry.register(
            widget("core", &log)
                .with_priority(ComponentPriority::Critical)
                .with_memory_cost(500.0),
        );
        registry.register(widget("tiny", &log).with_memory_cost(1.0));

        assert!(registry.load("core").await.unwrap().is_ready());
        assert!(registry.load("tiny").await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn dependencies_load_first() {
        let (registry, _probe) = registry_at(10.0);
        let log = EventLog::default();
        registry.register(widget("a", &log).depends_on("b"));
        registry.register(widget("b", &log));

        assert!(registry.load("a").await.unwrap().is_ready());
        assert_eq!(*log.lock(), vec!["build:b", "build:a"]);
        assert!(registry.is_loaded("a"));
        assert!(registry.is_loaded("b"));
    }

    #[tokio::test]
    async fn missing_dependency_is_skipped() {
        let (registry, _probe) = registry_at(10.0);
        let log = EventLog::default();
        registry.register(widget("a", &log).depends_on("ghost"));

        assert!(registry.load("a").await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn dependency_cycle_is_rejected() {
        let (registry, _probe) = registry_at(10.0);
        let log = EventLog::default();
        registry.register(widget("a", &log).depends_on("b"));
        registry.register(widget("b", &log).depends_on("a"));

        let err = registry.load("a").await.unwrap_err();
        assert!(matches!(err, LifecycleError::CircularDependency(_)));
        assert!(!registry.is_loaded("a"));
        assert!(!registry.is_loaded("b"));
        assert_eq!(registry.stats().loading, 0);
    }

    #[tokio::test]
    async fn deferred_dependency_defers_dependent() {
        let (registry, _probe) = registry_at(85.0);
        let log = EventLog::default();
        registry.register(widget("a", &log).depends_on("model"));
        registry.register(widget("model", &log).with_memory_cost(200.0));

        let outcome = registry.load("a").await.unwrap();
        assert!(outcome.is_deferred());
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_instance() {
        let (registry, _probe) = registry_at(10.0);
        let registry = Arc::new(registry);
        let builds = Arc::new(AtomicUsize::new(0));

        let counter = builds.clone();
        registry.register(ComponentDefinition::new_async("slow", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Widget {
                    name: "slow".to_string(),
                    log: EventLog::default(),
                })
            }
        }));

        let loads = (0..8).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.load("slow").await })
        });
        let instances: Vec<ComponentInstance> = futures::future::join_all(loads)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap().ready().unwrap())
            .collect();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(instances.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.info("slow").unwrap().access_count, 8);
    }

    #[tokio::test]
    async fn unload_runs_teardown_then_shutdown() {
        let (registry, _probe) = registry_at(10.0);
        let log = EventLog::default();
        let teardown_log = log.clone();
        registry.register(widget("db", &log).with_memory_cost(3.0).with_teardown(
            move |_instance| {
                let log = teardown_log.clone();
                async move {
                    log.lock().push("teardown:db".to_string());
                    Ok(())
                }
            },
        ));

        let first = registry.load("db").await.unwrap().ready().unwrap();
        assert_eq!(registry.stats().estimated_memory_mb, 3.0);
        assert!(registry.unload("db").await.unwrap());
        assert!(!registry.unload("db").await.unwrap());
        assert_eq!(registry.stats().estimated_memory_mb, 0.0);

        let second = registry.load("db").await.unwrap().ready().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(
            *log.lock(),
            vec!["build:db", "teardown:db", "shutdown:db", "build:db"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_unload_still_tears_down() {
        let registry = LazyComponentRegistry::new(None, RegistryConfig::default());
        let log = EventLog::default();
        let teardown_log = log.clone();
        registry.register(widget("db", &log).with_memory_cost(3.0).with_teardown(
            move |_instance| {
                let log = teardown_log.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    log.lock().push("teardown:db".to_string());
                    Ok(())
                }
            },
        ));
        registry.load("db").await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_millis(50), registry.unload("db")).await;
        assert!(outcome.is_err(), "unload outlived the timeout");
        assert_eq!(registry.stats().estimated_memory_mb, 0.0);
        assert!(!registry.is_loaded("db"));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(*log.lock(), vec!["build:db", "teardown:db", "shutdown:db"]);
        assert!(registry.load("db").await.unwrap().is_ready());
        assert_eq!(registry.stats().estimated_memory_mb, 3.0);
    }

    #[tokio::test]
    async fn deferral_check_samples_through_the_monitor() {
        let probe = Arc::new(ManualMemoryProbe::at_percentage(95.0));
        let monitor = Arc::new(MemoryMonitor::new(probe, MonitorConfig::default()));
        let registry = LazyComponentRegistry::new(Some(monitor.clone()), RegistryConfig::default());
        let log = EventLog::default();
        registry.register(
            widget("cache", &log)
                .with_priority(ComponentPriority::Low)
                .with_memory_cost(10.0)
                .with_strategy(LoadStrategy::Preload),
        );

        assert!(registry.load("cache").await.unwrap().deferred().is_some());
        assert!(
            monitor
                .latest()
                .is_some_and(|stats| stats.pressure_level == PressureLevel::Critical)
        );

        let report = registry.preload().await;
        assert!(report.aborted);
        assert_eq!(monitor.history(10).count(), 2);
    }

    #[tokio::test]
    async fn typed_load_downcasts() {
        let (registry, _probe) = registry_at(10.0);
        let log = EventLog::default();
        registry.register(widget("w", &log));

        let typed = registry.load_as::<Widget>("w").await.unwrap().ready().unwrap();
        assert_eq!(typed.name, "w");

        let err = registry.load_as::<String>("w").await.unwrap_err();
        assert!(matches!(err, LifecycleError::TypeMismatch { .. }));
    }

    #[tokio::test]
    async fn unknown_component_is_not_found() {
        let (registry, _probe) = registry_at(10.0);
        let err = registry.load("nope").await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::NotFound {
                kind: EntityKind::Component,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn factory_failure_releases_the_slot() {
        let (registry, _probe) = registry_at(10.0);
        registry.register(ComponentDefinition::new("broken", || {
            Err::<Widget, _>(anyhow::anyhow!("no backend"))
        }));

        let err = registry.load("broken").await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!registry.info("broken").unwrap().loading);
        assert_eq!(registry.stats().failures, 1);
    }

    #[tokio::test]
    async fn pressure_unloads_by_priority_tier() {
        let (registry, _probe) = registry_at(10.0);
        let log = EventLog::default();
        registry.register(widget("opt", &log).with_priority(ComponentPriority::Optional));
        registry.register(widget("low", &log).with_priority(ComponentPriority::Low));
        registry.register(widget("mid", &log).with_priority(ComponentPriority::Medium));
        registry.register(widget("high", &log).with_priority(ComponentPriority::High));
        for name in ["opt", "low", "mid", "high"] {
            registry.load(name).await.unwrap();
        }

        assert!(registry.handle_pressure(PressureLevel::Moderate).await.is_empty());
        assert_eq!(
            registry.handle_pressure(PressureLevel::High).await,
            vec!["opt", "low"]
        );
        assert_eq!(
            registry.handle_pressure(PressureLevel::Critical).await,
            vec!["mid"]
        );
        assert!(registry.is_loaded("high"));
    }

    #[tokio::test]
    async fn preload_respects_priority_and_runs_once() {
        let (registry, _probe) = registry_at(10.0);
        let log = EventLog::default();
        registry.register(
            widget("b", &log)
                .with_strategy(LoadStrategy::Preload)
                .with_priority(ComponentPriority::Low),
        );
        registry.register(
            widget("a", &log)
                .with_strategy(LoadStrategy::Smart)
                .with_priority(ComponentPriority::High),
        );
        registry.register(widget("lazy", &log));

        let report = registry.preload().await;
        assert_eq!(report.loaded, vec!["a", "b"]);
        assert!(!registry.is_loaded("lazy"));

        let again = registry.preload().await;
        assert!(again.loaded.is_empty());
    }

    #[tokio::test]
    async fn preload_skips_under_moderate_and_aborts_under_high() {
        let (registry, _probe) = registry_at(75.0);
        let log = EventLog::default();
        registry.register(widget("p", &log).with_strategy(LoadStrategy::Preload));
        let report = registry.preload().await;
        assert_eq!(report.skipped, vec!["p"]);
        assert!(!report.aborted);

        let (registry, _) = registry_at(85.0);
        registry.register(widget("p", &log).with_strategy(LoadStrategy::Preload));
        let report = registry.preload().await;
        assert!(report.aborted);
        assert!(report.loaded.is_empty());
    }

    #[tokio::test]
    async fn initialize_loads_immediate_components() {
        let (registry, _probe) = registry_at(10.0);
        let log = EventLog::default();
        registry.register(widget("boot", &log).with_strategy(LoadStrategy::Immediate));
        registry.register(widget("later", &log));

        let report = registry.initialize().await;
        assert_eq!(report.loaded, vec!["boot"]);
        assert!(!registry.is_loaded("later"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_components_are_unloaded() {
        let registry = LazyComponentRegistry::new(None, RegistryConfig::default());
        let log = EventLog::default();
        registry.register(widget("idle", &log).with_strategy(LoadStrategy::Smart));
        registry.register(widget("fresh", &log));
        registry.register(widget("boot", &log).with_strategy(LoadStrategy::Immediate));

        registry.load("idle").await.unwrap();
        registry.load("boot").await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        registry.load("fresh").await.unwrap();

        let unloaded = registry.unload_idle(Duration::from_secs(60)).await;
        assert_eq!(unloaded, vec!["idle"]);
        assert!(registry.is_loaded("fresh"));
        assert!(registry.is_loaded("boot"));
    }

    #[tokio::test]
    async fn reregistering_keeps_loaded_instance() {
        let (registry, _probe) = registry_at(10.0);
        let log = EventLog::default();
        registry.register(widget("w", &log));
        let first = registry.load("w").await.unwrap().ready().unwrap();

        registry.register(widget("w", &log).with_priority(ComponentPriority::High));
        let second = registry.load("w").await.unwrap().ready().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.info("w").unwrap().priority, "High");
    }
}
