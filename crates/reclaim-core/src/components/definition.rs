use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use reclaim_traits::Component;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::monitor::PressureLevel;

/// Shared handle to a loaded component.
pub type ComponentInstance = Arc<dyn Component>;

type SyncFactoryFn = Arc<dyn Fn() -> Result<ComponentInstance> + Send + Sync>;
type AsyncFactoryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<ComponentInstance>> + Send + Sync>;

/// Teardown run on every unload, before [`Component::shutdown`].
pub type ComponentTeardown =
    Arc<dyn Fn(ComponentInstance) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Load priority. Ordered from least to most important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentPriority {
    Optional = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

/// When a component is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStrategy {
    /// During startup composition.
    Immediate,
    /// On first `load`.
    OnDemand,
    /// In the background preload pass shortly after startup.
    Preload,
    /// Preloaded when memory allows, unloaded again when idle.
    Smart,
}

impl LoadStrategy {
    pub fn is_preloaded(&self) -> bool {
        matches!(self, LoadStrategy::Preload | LoadStrategy::Smart)
    }
}

/// Sync or async constructor.
#[derive(Clone)]
pub enum ComponentFactory {
    Sync(SyncFactoryFn),
    Async(AsyncFactoryFn),
}

impl ComponentFactory {
    pub async fn build(&self) -> Result<ComponentInstance> {
        match self {
            ComponentFactory::Sync(factory) => factory(),
            ComponentFactory::Async(factory) => factory().await,
        }
    }
}

impl fmt::Debug for ComponentFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentFactory::Sync(_) => f.write_str("ComponentFactory::Sync"),
            ComponentFactory::Async(_) => f.write_str("ComponentFactory::Async"),
        }
    }
}

/// Registration record for a lazily loaded component.
///
/// # Example
///
/// ```ignore
/// let definition = ComponentDefinition::new("embedder", || Ok(Embedder::new()))
///     .with_priority(ComponentPriority::High)
///     .with_strategy(LoadStrategy::Preload)
///     .depends_on("tokenizer")
///     .with_memory_cost(64.0);
/// registry.register(definition);
/// ```
#[derive(Clone)]
pub struct ComponentDefinition {
    pub name: String,
    pub factory: ComponentFactory,
    pub priority: ComponentPriority,
    pub strategy: LoadStrategy,
    pub dependencies: Vec<String>,
    /// Estimated resident cost once loaded, in megabytes.
    pub memory_cost_mb: f64,
    pub teardown: Option<ComponentTeardown>,
}

impl ComponentDefinition {
    /// Define a component with a synchronous factory.
    pub fn new<F, C>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<C> + Send + Sync + 'static,
        C: Component,
    {
        let factory: SyncFactoryFn =
            Arc::new(move || factory().map(|component| Arc::new(component) as ComponentInstance));
        Self::with_factory(name, ComponentFactory::Sync(factory))
    }

    /// Define a component with an async factory.
    pub fn new_async<F, Fut, C>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<C>> + Send + 'static,
        C: Component,
    {
        let factory: AsyncFactoryFn = Arc::new(move || {
            factory()
                .map(|built| built.map(|component| Arc::new(component) as ComponentInstance))
                .boxed()
        });
        Self::with_factory(name, ComponentFactory::Async(factory))
    }

    pub fn with_factory(name: impl Into<String>, factory: ComponentFactory) -> Self {
        Self {
            name: name.into(),
            factory,
            priority: ComponentPriority::Medium,
            strategy: LoadStrategy::OnDemand,
            dependencies: Vec::new(),
            memory_cost_mb: 0.0,
            teardown: None,
        }
    }

    pub fn with_priority(mut self, priority: ComponentPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_strategy(mut self, strategy: LoadStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_memory_cost(mut self, memory_cost_mb: f64) -> Self {
        self.memory_cost_mb = memory_cost_mb.max(0.0);
        self
    }

    pub fn with_teardown<F, Fut>(mut self, teardown: F) -> Self
    where
        F: Fn(ComponentInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.teardown = Some(Arc::new(move |instance| teardown(instance).boxed()));
        self
    }
}

impl fmt::Debug for ComponentDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentDefinition")
            .field("name", &self.name)
            .field("factory", &self.factory)
            .field("priority", &self.priority)
            .field("strategy", &self.strategy)
            .field("dependencies", &self.dependencies)
            .field("memory_cost_mb", &self.memory_cost_mb)
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

/// A load postponed because of memory pressure. Callers may retry later.
#[derive(Debug, Clone)]
pub struct DeferredLoad {
    pub name: String,
    pub pressure: PressureLevel,
    pub reason: String,
}

/// Result of a load request.
#[derive(Clone)]
pub enum LoadOutcome<T = ComponentInstance> {
    Ready(T),
    Deferred(DeferredLoad),
}

impl<T> fmt::Debug for LoadOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadOutcome::Ready(_) => f.write_str("Ready(..)"),
            LoadOutcome::Deferred(deferred) => f.debug_tuple("Deferred").field(deferred).finish(),
        }
    }
}

impl<T> LoadOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, LoadOutcome::Ready(_))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, LoadOutcome::Deferred(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            LoadOutcome::Ready(value) => Some(value),
            LoadOutcome::Deferred(_) => None,
        }
    }

    pub fn deferred(&self) -> Option<&DeferredLoad> {
        match self {
            LoadOutcome::Ready(_) => None,
            LoadOutcome::Deferred(deferred) => Some(deferred),
        }
    }
}
