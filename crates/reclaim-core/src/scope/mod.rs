//! Request-scoped resource containers.
//!
//! A [`RequestScope`] owns whatever was built to serve one unit of work. The
//! [`RequestScopeManager`] indexes live scopes, guarantees disposal on every
//! exit path of [`RequestScopeManager::with_scope`], and force-disposes scopes
//! that outlive the configured age.

mod request;

pub use request::{RequestScope, ScopedTeardown, scoped_teardown};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counters for scope activity.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeStats {
    pub active: usize,
    pub opened: u64,
    pub disposed: u64,
    pub expired: u64,
}

#[derive(Default)]
struct ScopeIndex {
    scopes: Mutex<HashMap<String, Arc<RequestScope>>>,
    sequence: AtomicU64,
    disposed: AtomicU64,
    expired: AtomicU64,
}

impl ScopeIndex {
    /// Remove `scope` from the index if it is still the registered entry.
    fn detach(&self, scope: &Arc<RequestScope>) {
        let mut scopes = self.scopes.lock();
        if scopes
            .get(scope.request_id())
            .is_some_and(|current| Arc::ptr_eq(current, scope))
        {
            scopes.remove(scope.request_id());
        }
    }

    /// Detach and dispose `scope` on a spawned task, so a cancelled caller
    /// still leaves the scope fully disposed and counted.
    async fn dispose(self: &Arc<Self>, scope: &Arc<RequestScope>) -> bool {
        self.detach(scope);
        let index = self.clone();
        let target = scope.clone();
        let task = tokio::spawn(async move {
            let disposed = target.dispose().await;
            if disposed {
                index.disposed.fetch_add(1, Ordering::Relaxed);
            }
            disposed
        });
        match task.await {
            Ok(disposed) => disposed,
            Err(e) => {
                warn!(request_id = %scope.request_id(), error = %e, "Scope disposal task failed");
                false
            }
        }
    }
}

/// Index of live request scopes. Cheap to clone.
#[derive(Clone, Default)]
pub struct RequestScopeManager {
    index: Arc<ScopeIndex>,
}

impl RequestScopeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh request id.
    pub fn new_request_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Open a scope and return a guard that disposes it.
    ///
    /// An empty `request_id` gets a generated one. Opening a scope under an id
    /// that is still live replaces the old scope, which is disposed in the
    /// background.
    pub fn open_scope(
        &self,
        request_id: impl Into<String>,
        owner_id: impl Into<String>,
        memory_limit: Option<u64>,
    ) -> ScopeGuard {
        let mut request_id = request_id.into();
        if request_id.is_empty() {
            request_id = Self::new_request_id();
        }
        let sequence = self.index.sequence.fetch_add(1, Ordering::Relaxed);
        let scope = Arc::new(RequestScope::new(
            request_id.clone(),
            owner_id.into(),
            memory_limit,
            sequence,
        ));

        let replaced = self
            .index
            .scopes
            .lock()
            .insert(request_id.clone(), scope.clone());
        if let Some(previous) = replaced {
            warn!(request_id = %request_id, "Replacing live request scope with the same id");
            self.dispose_in_background(previous);
        }

        debug!(
            request_id = %request_id,
            owner = %scope.owner_id(),
            "Request scope opened"
        );
        ScopeGuard {
            scope,
            index: self.index.clone(),
            closed: false,
        }
    }

    /// Run `body` inside a fresh scope, disposing the scope however it exits.
    pub async fn with_scope<F, Fut, T, E>(
        &self,
        request_id: impl Into<String>,
        owner_id: impl Into<String>,
        memory_limit: Option<u64>,
        body: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce(Arc<RequestScope>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let guard = self.open_scope(request_id, owner_id, memory_limit);
        let result = body(guard.scope()).await;
        guard.close().await;
        result
    }

    pub fn get(&self, request_id: &str) -> Option<Arc<RequestScope>> {
        self.index.scopes.lock().get(request_id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.index.scopes.lock().len()
    }

    /// Dispose a scope by id. Returns `false` if no such live scope exists.
    pub async fn dispose(&self, request_id: &str) -> bool {
        let Some(scope) = self.get(request_id) else {
            return false;
        };
        self.index.dispose(&scope).await
    }

    /// Force-dispose scopes older than `max_age`, oldest first.
    pub async fn sweep_expired(&self, max_age: Duration) -> Vec<String> {
        let mut expired: Vec<Arc<RequestScope>> = self
            .index
            .scopes
            .lock()
            .values()
            .filter(|scope| scope.age() > max_age)
            .cloned()
            .collect();
        expired.sort_by_key(|scope| scope.sequence);

        let mut swept = Vec::with_capacity(expired.len());
        for scope in expired {
            warn!(
                request_id = %scope.request_id(),
                owner = %scope.owner_id(),
                age_secs = scope.age().as_secs(),
                "Force-disposing expired request scope"
            );
            if self.index.dispose(&scope).await {
                self.index.expired.fetch_add(1, Ordering::Relaxed);
                swept.push(scope.request_id().to_string());
            }
        }
        swept
    }

    /// Spawn the periodic expiry sweep.
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = manager.sweep_expired(max_age).await;
                        if !swept.is_empty() {
                            info!(count = swept.len(), "Expired request scopes swept");
                        }
                    }
                }
            }
            debug!("Scope sweeper stopped");
        })
    }

    /// Dispose every live scope in creation order.
    pub async fn dispose_all(&self) -> usize {
        let mut scopes: Vec<Arc<RequestScope>> = self
            .index
            .scopes
            .lock()
            .drain()
            .map(|(_, scope)| scope)
            .collect();
        scopes.sort_by_key(|scope| scope.sequence);

        let mut disposed = 0;
        for scope in scopes {
            if self.index.dispose(&scope).await {
                disposed += 1;
            }
        }
        if disposed > 0 {
            info!(count = disposed, "Disposed all request scopes");
        }
        disposed
    }

    pub fn stats(&self) -> ScopeStats {
        ScopeStats {
            active: self.active_count(),
            opened: self.index.sequence.load(Ordering::Relaxed),
            disposed: self.index.disposed.load(Ordering::Relaxed),
            expired: self.index.expired.load(Ordering::Relaxed),
        }
    }

    fn dispose_in_background(&self, scope: Arc<RequestScope>) {
        spawn_disposal(self.index.clone(), scope);
    }
}

fn spawn_disposal(index: Arc<ScopeIndex>, scope: Arc<RequestScope>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                index.dispose(&scope).await;
            });
        }
        Err(_) => {
            index.detach(&scope);
            warn!(
                request_id = %scope.request_id(),
                "No runtime available, request scope cleanups skipped"
            );
        }
    }
}

/// Owns an open scope. Dropping it without [`ScopeGuard::close`] schedules
/// disposal on the current runtime.
pub struct ScopeGuard {
    scope: Arc<RequestScope>,
    index: Arc<ScopeIndex>,
    closed: bool,
}

impl ScopeGuard {
    pub fn scope(&self) -> Arc<RequestScope> {
        self.scope.clone()
    }

    /// Dispose the scope now.
    pub async fn close(mut self) {
        self.index.dispose(&self.scope).await;
        self.closed = true;
    }
}

impl Deref for ScopeGuard {
    type Target = RequestScope;

    fn deref(&self) -> &RequestScope {
        &self.scope
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.closed || self.scope.is_disposed() {
            return;
        }
        debug!(
            request_id = %self.scope.request_id(),
            "Scope guard dropped without close, disposing in background"
        );
        spawn_disposal(self.index.clone(), self.scope.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EntityKind, LifecycleError};
    use reclaim_traits::Teardown;

    type Log = Arc<Mutex<Vec<String>>>;

    fn logging_cleanup(log: &Log, label: &str) -> Teardown {
        let log = log.clone();
        let entry = label.to_string();
        Teardown::sync(label, move || {
            log.lock().push(entry);
            Ok(())
        })
    }

    #[tokio::test]
    async fn cleanups_run_in_reverse_order_once() {
        let manager = RequestScopeManager::new();
        let log = Log::default();

        let scope = manager
            .with_scope("req-1", "alice", None, |scope| {
                let log = log.clone();
                async move {
                    scope.add_cleanup(logging_cleanup(&log, "first"))?;
                    scope.get_or_create(
                        "buffer",
                        || Ok(vec![0u8; 16]),
                        scoped_teardown(move |_buffer: Arc<Vec<u8>>| {
                            let log = log.clone();
                            async move {
                                log.lock().push("buffer".to_string());
                                Ok(())
                            }
                        }),
                    )?;
                    scope.add_cleanup(Teardown::sync("failing", || anyhow::bail!("boom")))?;
                    Ok::<_, LifecycleError>(scope)
                }
            })
            .await
            .unwrap();

        assert_eq!(*log.lock(), vec!["buffer", "first"]);
        assert!(scope.is_disposed());
        assert_eq!(scope.component_count(), 0);
        assert_eq!(manager.active_count(), 0);
        assert!(!scope.dispose().await);
        assert_eq!(log.lock().len(), 2);

        let err = scope
            .get_or_create("late", || Ok(1u32), None)
            .unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Disposed {
                kind: EntityKind::Scope,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn error_exit_still_disposes() {
        let manager = RequestScopeManager::new();
        let log = Log::default();

        let result: Result<(), anyhow::Error> = manager
            .with_scope("req-err", "bob", None, |scope| {
                let log = log.clone();
                async move {
                    scope.add_cleanup(logging_cleanup(&log, "closed"))?;
                    Err(anyhow::anyhow!("handler failed"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(*log.lock(), vec!["closed"]);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn components_are_not_shared_across_scopes() {
        let manager = RequestScopeManager::new();
        let first = manager.open_scope("one", "carol", None);
        let second = manager.open_scope("two", "carol", None);

        let a = first.get_or_create("x", || Ok(String::from("x")), None).unwrap();
        let again = first.get_or_create("x", || Ok(String::from("other")), None).unwrap();
        let b = second
            .get_or_create_async("x", || async { Ok(String::from("x")) }, None)
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));

        let err = first.get_or_create("x", || Ok(7u64), None).unwrap_err();
        assert!(matches!(err, LifecycleError::TypeMismatch { .. }));

        first.close().await;
        second.close().await;
        assert_eq!(manager.stats().disposed, 2);
    }

    #[tokio::test]
    async fn dropped_guard_disposes_in_background() {
        let manager = RequestScopeManager::new();
        let log = Log::default();

        let scope = {
            let guard = manager.open_scope("dropped", "dave", None);
            guard.add_cleanup(logging_cleanup(&log, "dropped")).unwrap();
            guard.scope()
        };

        for _ in 0..50 {
            if scope.is_disposed() && !log.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(scope.is_disposed());
        assert_eq!(*log.lock(), vec!["dropped"]);
        assert!(manager.get("dropped").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_close_still_runs_every_cleanup() {
        let manager = RequestScopeManager::new();
        let log = Log::default();
        let opened: Arc<Mutex<Option<Arc<RequestScope>>>> = Arc::default();

        let body_log = log.clone();
        let slot = opened.clone();
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            manager.with_scope("slow", "hank", None, move |scope| async move {
                *slot.lock() = Some(scope.clone());
                scope.get_or_create("local", || Ok(3u8), None)?;
                scope.add_cleanup(logging_cleanup(&body_log, "first"))?;
                let log = body_log.clone();
                scope.add_cleanup(Teardown::new("slow", move || async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    log.lock().push("slow".to_string());
                    Ok(())
                }))?;
                Ok::<_, LifecycleError>(())
            }),
        )
        .await;
        assert!(outcome.is_err(), "close outlived the timeout");

        tokio::time::sleep(Duration::from_millis(400)).await;
        let scope = opened.lock().clone().unwrap();
        assert_eq!(*log.lock(), vec!["slow", "first"]);
        assert!(scope.is_disposed());
        assert_eq!(scope.component_count(), 0);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.stats().disposed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_disposes_expired_scopes() {
        let manager = RequestScopeManager::new();
        let log = Log::default();
        let cancel = CancellationToken::new();
        let guard = manager.open_scope("stale", "ivy", None);
        guard.add_cleanup(logging_cleanup(&log, "stale")).unwrap();
        let scope = guard.scope();

        let sweeper = manager.spawn_sweeper(
            Duration::from_secs(10),
            Duration::from_secs(30),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!scope.is_disposed());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(scope.is_disposed());
        assert_eq!(*log.lock(), vec!["stale"]);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.stats().expired, 1);

        cancel.cancel();
        sweeper.await.unwrap();
        drop(guard);
    }

    #[tokio::test]
    async fn memory_limit_is_reported() {
        let manager = RequestScopeManager::new();
        let guard = manager.open_scope("", "erin", Some(1_000));
        assert!(!guard.request_id().is_empty());

        assert!(guard.track_memory(600).unwrap());
        assert!(!guard.track_memory(600).unwrap());
        assert_eq!(guard.memory_used(), 1_200);
        guard.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_scopes_are_swept() {
        let manager = RequestScopeManager::new();
        let old = manager.open_scope("old", "frank", None);
        tokio::time::advance(Duration::from_secs(400)).await;
        let fresh = manager.open_scope("fresh", "frank", None);

        let swept = manager.sweep_expired(Duration::from_secs(300)).await;
        assert_eq!(swept, vec!["old"]);
        assert!(old.is_disposed());
        assert!(!fresh.is_disposed());
        assert_eq!(manager.stats().expired, 1);
        assert_eq!(manager.active_count(), 1);
        fresh.close().await;
    }

    #[tokio::test]
    async fn dispose_all_uses_creation_order() {
        let manager = RequestScopeManager::new();
        let log = Log::default();
        let mut guards = Vec::new();
        for id in ["s1", "s2", "s3"] {
            let guard = manager.open_scope(id, "gina", None);
            guard.add_cleanup(logging_cleanup(&log, id)).unwrap();
            guards.push(guard);
        }

        assert_eq!(manager.dispose_all().await, 3);
        assert_eq!(*log.lock(), vec!["s1", "s2", "s3"]);
        assert_eq!(manager.active_count(), 0);
        drop(guards);
        assert_eq!(manager.dispose_all().await, 0);
    }
}
