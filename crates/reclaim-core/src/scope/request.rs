use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use reclaim_traits::Teardown;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{EntityKind, LifecycleError, Result};

/// Cleanup for a scope-local component, handed the cached instance.
pub type ScopedTeardown<T> = Box<dyn FnOnce(Arc<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Wrap an async closure as a [`ScopedTeardown`].
pub fn scoped_teardown<T, F, Fut>(teardown: F) -> Option<ScopedTeardown<T>>
where
    F: FnOnce(Arc<T>) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Some(Box::new(move |instance| teardown(instance).boxed()))
}

type ScopedValue = Arc<dyn Any + Send + Sync>;

struct ScopeState {
    components: HashMap<String, ScopedValue>,
    cleanups: Vec<Teardown>,
    memory_used: u64,
    disposed: bool,
}

/// Everything created to serve one request.
///
/// Components cached here are never visible to other scopes, even scopes of
/// the same owner. Cleanups run in reverse registration order when the scope
/// is disposed, and disposal happens exactly once.
pub struct RequestScope {
    request_id: String,
    owner_id: String,
    created_at: DateTime<Utc>,
    opened: Instant,
    pub(super) sequence: u64,
    memory_limit: Option<u64>,
    state: Mutex<ScopeState>,
}

impl std::fmt::Debug for RequestScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScope")
            .field("request_id", &self.request_id)
            .field("owner_id", &self.owner_id)
            .field("created_at", &self.created_at)
            .field("memory_limit", &self.memory_limit)
            .finish_non_exhaustive()
    }
}

impl RequestScope {
    pub(super) fn new(
        request_id: String,
        owner_id: String,
        memory_limit: Option<u64>,
        sequence: u64,
    ) -> Self {
        Self {
            request_id,
            owner_id,
            created_at: Utc::now(),
            opened: Instant::now(),
            sequence,
            memory_limit,
            state: Mutex::new(ScopeState {
                components: HashMap::new(),
                cleanups: Vec::new(),
                memory_used: 0,
                disposed: false,
            }),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    pub fn memory_limit(&self) -> Option<u64> {
        self.memory_limit
    }

    pub fn memory_used(&self) -> u64 {
        self.state.lock().memory_used
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn component_count(&self) -> usize {
        self.state.lock().components.len()
    }

    /// Return the scope-local component `name`, building it on first use.
    ///
    /// The factory runs without the scope lock held. If another caller cached
    /// the same name in the meantime, theirs wins and the new value is dropped.
    pub fn get_or_create<T, F>(
        &self,
        name: &str,
        factory: F,
        teardown: Option<ScopedTeardown<T>>,
    ) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> anyhow::Result<T>,
    {
        if let Some(existing) = self.cached::<T>(name)? {
            return Ok(existing);
        }
        let instance = factory().map_err(|source| LifecycleError::LoadFailed {
            name: name.to_string(),
            source,
        })?;
        self.insert(name, Arc::new(instance), teardown)
    }

    /// Async variant of [`Self::get_or_create`].
    pub async fn get_or_create_async<T, F, Fut>(
        &self,
        name: &str,
        factory: F,
        teardown: Option<ScopedTeardown<T>>,
    ) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(existing) = self.cached::<T>(name)? {
            return Ok(existing);
        }
        let instance = factory()
            .await
            .map_err(|source| LifecycleError::LoadFailed {
                name: name.to_string(),
                source,
            })?;
        self.insert(name, Arc::new(instance), teardown)
    }

    /// Register an ad-hoc cleanup callback.
    pub fn add_cleanup(&self, teardown: Teardown) -> Result<()> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(LifecycleError::disposed(EntityKind::Scope, &self.request_id));
        }
        state.cleanups.push(teardown);
        Ok(())
    }

    /// Add to the scope's memory estimate.
    ///
    /// Returns `false` once the estimate exceeds the scope's limit.
    pub fn track_memory(&self, bytes: u64) -> Result<bool> {
        let used = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(LifecycleError::disposed(EntityKind::Scope, &self.request_id));
            }
            state.memory_used = state.memory_used.saturating_add(bytes);
            state.memory_used
        };
        match self.memory_limit {
            Some(limit) if used > limit => {
                warn!(
                    request_id = %self.request_id,
                    owner = %self.owner_id,
                    used_bytes = used,
                    limit_bytes = limit,
                    "Request scope exceeded its memory limit"
                );
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// Run every cleanup in reverse order and drop cached components.
    ///
    /// The cleanups run on their own task, so dropping the returned future
    /// does not cut the sequence short. Returns `false` if the scope was
    /// already disposed.
    pub async fn dispose(self: &Arc<Self>) -> bool {
        let cleanups = {
            let mut state = self.state.lock();
            if state.disposed {
                return false;
            }
            state.disposed = true;
            std::mem::take(&mut state.cleanups)
        };

        let scope = self.clone();
        let task = tokio::spawn(async move { scope.run_cleanups(cleanups).await });
        if let Err(e) = task.await {
            warn!(
                request_id = %self.request_id,
                error = %e,
                "Scope cleanup task failed"
            );
        }
        true
    }

    async fn run_cleanups(&self, cleanups: Vec<Teardown>) {
        let total = cleanups.len();
        let mut failures = 0;
        for teardown in cleanups.into_iter().rev() {
            let label = teardown.label().to_string();
            if let Err(e) = teardown.run().await {
                failures += 1;
                warn!(
                    request_id = %self.request_id,
                    cleanup = %label,
                    error = %e,
                    "Scope cleanup failed"
                );
            }
        }

        let mut state = self.state.lock();
        state.components.clear();
        state.memory_used = 0;
        drop(state);

        debug!(
            request_id = %self.request_id,
            cleanups = total,
            failures,
            age_ms = self.age().as_millis() as u64,
            "Request scope disposed"
        );
    }

    fn cached<T: Send + Sync + 'static>(&self, name: &str) -> Result<Option<Arc<T>>> {
        let state = self.state.lock();
        if state.disposed {
            return Err(LifecycleError::disposed(EntityKind::Scope, &self.request_id));
        }
        state
            .components
            .get(name)
            .map(|value| downcast::<T>(name, value.clone()))
            .transpose()
    }

    fn insert<T: Send + Sync + 'static>(
        &self,
        name: &str,
        instance: Arc<T>,
        teardown: Option<ScopedTeardown<T>>,
    ) -> Result<Arc<T>> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(LifecycleError::disposed(EntityKind::Scope, &self.request_id));
        }
        if let Some(existing) = state.components.get(name) {
            return downcast::<T>(name, existing.clone());
        }
        state
            .components
            .insert(name.to_string(), instance.clone() as ScopedValue);
        if let Some(teardown) = teardown {
            let target = instance.clone();
            state
                .cleanups
                .push(Teardown::new(name, move || teardown(target)));
        }
        Ok(instance)
    }
}

fn downcast<T: Send + Sync + 'static>(name: &str, value: ScopedValue) -> Result<Arc<T>> {
    value
        .downcast::<T>()
        .map_err(|_| LifecycleError::TypeMismatch {
            name: name.to_string(),
            expected: std::any::type_name::<T>(),
        })
}
