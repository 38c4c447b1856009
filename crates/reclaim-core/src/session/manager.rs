use dashmap::DashMap;
use futures::future::join_all;
use reclaim_traits::{DuplexChannel, Teardown};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{SessionResource, SessionState, SessionStats, SweepReport, UserSession};
use crate::error::{EntityKind, LifecycleError, Result};
use crate::monitor::PressureLevel;

/// Session timing configuration.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Sessions inactive for longer than this are disposed by the sweep.
    pub session_timeout: Duration,
    /// Active sessions inactive for longer than this become Idle.
    pub idle_timeout: Duration,
    /// How long a disconnected session survives before disposal.
    pub disconnect_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(300),
            disconnect_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct SessionCounters {
    created: AtomicU64,
    disposed: AtomicU64,
    expired: AtomicU64,
    shed: AtomicU64,
}

struct SessionIndex {
    sessions: DashMap<String, Arc<UserSession>>,
    channels: DashMap<String, String>,
    users: DashMap<String, HashSet<String>>,
    config: SessionConfig,
    counters: SessionCounters,
    /// Stops pending grace timers on shutdown.
    cancel: CancellationToken,
}

impl SessionIndex {
    /// Drop a disposed session from every index.
    ///
    /// A replacement registered under the same id keeps the id entry and
    /// whatever channel or user entries it shares with the disposed session.
    fn detach(&self, session: &Arc<UserSession>, channel_id: Option<&str>) {
        let session_id = session.session_id();
        self.sessions
            .remove_if(session_id, |_, current| Arc::ptr_eq(current, session));
        let successor = self
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone());

        if let Some(channel_id) = channel_id {
            let taken_over = successor
                .as_ref()
                .is_some_and(|next| next.channel_id().as_deref() == Some(channel_id));
            if !taken_over {
                self.channels
                    .remove_if(channel_id, |_, owner| owner == session_id);
            }
        }

        let user_id = session.user_id();
        if successor
            .as_ref()
            .is_some_and(|next| next.user_id() == user_id)
        {
            return;
        }
        if let Some(mut ids) = self.users.get_mut(user_id) {
            ids.remove(session_id);
        }
        self.users.remove_if(user_id, |_, ids| ids.is_empty());
    }

    async fn finish_disposal(
        &self,
        session: Arc<UserSession>,
        resources: Vec<SessionResource>,
        callbacks: Vec<Teardown>,
        channel_id: Option<String>,
    ) {
        let session_id = session.session_id();
        let resource_count = resources.len();
        join_all(
            resources
                .into_iter()
                .map(|resource| run_resource_teardown(session_id, resource)),
        )
        .await;

        for callback in callbacks {
            let label = callback.label().to_string();
            if let Err(e) = callback.run().await {
                warn!(
                    session_id = %session_id,
                    callback = %label,
                    error = %e,
                    "Session cleanup callback failed"
                );
            }
        }

        {
            let mut inner = session.inner.lock();
            inner.state = SessionState::Disposed;
            inner.memory_usage = 0;
        }
        self.detach(&session, channel_id.as_deref());
        self.counters.disposed.fetch_add(1, Ordering::Relaxed);
        info!(
            session_id = %session_id,
            user_id = %session.user_id(),
            resources = resource_count,
            "Session disposed"
        );
    }
}

/// Tracks user sessions and everything they own.
///
/// Cheap to clone; clones share the same index.
#[derive(Clone)]
pub struct SessionLifecycleManager {
    index: Arc<SessionIndex>,
}

impl SessionLifecycleManager {
    pub fn new(config: SessionConfig, cancel: CancellationToken) -> Self {
        Self {
            index: Arc::new(SessionIndex {
                sessions: DashMap::new(),
                channels: DashMap::new(),
                users: DashMap::new(),
                config,
                counters: SessionCounters::default(),
                cancel,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.index.config
    }

    /// Create a session, disposing any existing session with the same id first.
    pub async fn create_session(
        &self,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        thread_id: Option<String>,
        channel_id: Option<String>,
    ) -> Arc<UserSession> {
        let session_id = session_id.into();
        let user_id = user_id.into();

        if self.dispose_session(&session_id).await {
            info!(session_id = %session_id, "Replaced existing session");
        }

        let session = Arc::new(UserSession::new(
            session_id.clone(),
            user_id.clone(),
            thread_id,
            channel_id.clone(),
        ));
        let previous = self
            .index
            .sessions
            .insert(session_id.clone(), session.clone());
        self.index
            .users
            .entry(user_id.clone())
            .or_default()
            .insert(session_id.clone());
        if let Some(channel_id) = &channel_id {
            self.index
                .channels
                .insert(channel_id.clone(), session_id.clone());
        }
        self.index.counters.created.fetch_add(1, Ordering::Relaxed);

        // Lost a race with a concurrent create under the same id.
        if let Some(previous) = previous {
            self.dispose_entry(previous).await;
        }

        info!(
            session_id = %session_id,
            user_id = %user_id,
            channel_id = ?channel_id,
            "Session created"
        );
        session
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<UserSession>> {
        self.index
            .sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
    }

    /// Record activity. An idle session becomes active again.
    pub fn touch(&self, session_id: &str) -> Result<()> {
        let session = self.live(session_id)?;
        let mut inner = session.inner.lock();
        if inner.state.is_terminating() {
            return Err(LifecycleError::disposed(EntityKind::Session, session_id));
        }
        inner.record_activity();
        if inner.state == SessionState::Idle {
            inner.state = SessionState::Active;
            debug!(session_id = %session_id, "Session active again");
        }
        Ok(())
    }

    /// Attach a resource to a session.
    ///
    /// Returns `false` when the session does not exist or is being disposed.
    /// A resource registered under an existing id replaces it and the old
    /// resource is torn down.
    pub async fn register_resource<T>(
        &self,
        session_id: &str,
        resource_id: impl Into<String>,
        kind: impl Into<String>,
        instance: Arc<T>,
        teardown: Option<Teardown>,
        memory_estimate: u64,
    ) -> bool
    where
        T: Send + Sync + 'static,
    {
        let Some(session) = self.get(session_id) else {
            debug!(session_id = %session_id, "Resource registration for unknown session");
            return false;
        };
        let resource_id = resource_id.into();
        let resource = SessionResource {
            resource_id: resource_id.clone(),
            kind: kind.into(),
            instance,
            created_at: chrono::Utc::now(),
            teardown,
            memory_estimate,
        };

        let replaced = {
            let mut inner = session.inner.lock();
            if inner.state.is_terminating() {
                debug!(
                    session_id = %session_id,
                    resource_id = %resource_id,
                    "Resource registration rejected, session is disposing"
                );
                return false;
            }
            inner.memory_usage = inner.memory_usage.saturating_add(memory_estimate);
            inner.record_activity();
            let replaced = inner.resources.insert(resource_id.clone(), resource);
            if let Some(old) = &replaced {
                inner.memory_usage = inner.memory_usage.saturating_sub(old.memory_estimate);
            }
            replaced
        };

        if let Some(old) = replaced {
            debug!(session_id = %session_id, resource_id = %resource_id, "Resource replaced");
            run_resource_teardown(session_id, old).await;
        }
        true
    }

    /// Typed access to a session resource.
    pub fn get_resource<T>(&self, session_id: &str, resource_id: &str) -> Result<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let session = self.live(session_id)?;
        let inner = session.inner.lock();
        if inner.state.is_terminating() {
            return Err(LifecycleError::disposed(EntityKind::Session, session_id));
        }
        let resource = inner
            .resources
            .get(resource_id)
            .ok_or_else(|| LifecycleError::not_found(EntityKind::Resource, resource_id))?;
        resource
            .instance
            .clone()
            .downcast::<T>()
            .map_err(|_| LifecycleError::TypeMismatch {
                name: resource_id.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Remove one resource and run its teardown.
    pub async fn release_resource(&self, session_id: &str, resource_id: &str) -> Result<bool> {
        let session = self.live(session_id)?;
        let resource = {
            let mut inner = session.inner.lock();
            if inner.state.is_terminating() {
                return Err(LifecycleError::disposed(EntityKind::Session, session_id));
            }
            let Some(resource) = inner.resources.remove(resource_id) else {
                return Ok(false);
            };
            inner.memory_usage = inner.memory_usage.saturating_sub(resource.memory_estimate);
            resource
        };
        run_resource_teardown(session_id, resource).await;
        Ok(true)
    }

    /// Register a session-level callback, run after resource teardowns.
    pub fn add_cleanup_callback(&self, session_id: &str, teardown: Teardown) -> Result<()> {
        let session = self.live(session_id)?;
        let mut inner = session.inner.lock();
        if inner.state.is_terminating() {
            return Err(LifecycleError::disposed(EntityKind::Session, session_id));
        }
        inner.callbacks.push(teardown);
        Ok(())
    }

    /// Move a session to Disconnected and arm its grace timer.
    pub fn mark_disconnected(&self, session_id: &str) -> Result<()> {
        let session = self.live(session_id)?;
        let (epoch, channel_id) = {
            let mut inner = session.inner.lock();
            match inner.state {
                SessionState::CleaningUp | SessionState::Disposed => {
                    return Err(LifecycleError::disposed(EntityKind::Session, session_id));
                }
                SessionState::Disconnected => return Ok(()),
                SessionState::Active | SessionState::Idle => {}
            }
            inner.state = SessionState::Disconnected;
            inner.disconnect_epoch += 1;
            (inner.disconnect_epoch, inner.channel_id.take())
        };

        if let Some(channel_id) = &channel_id {
            self.index
                .channels
                .remove_if(channel_id, |_, owner| owner == session_id);
        }
        info!(
            session_id = %session_id,
            grace_secs = self.index.config.disconnect_grace.as_secs_f64(),
            "Session disconnected"
        );
        self.arm_grace_timer(&session, epoch);
        Ok(())
    }

    /// Handle a closed client channel. Returns the affected session, if any.
    pub fn channel_closed(&self, channel_id: &str) -> Option<String> {
        let session_id = self.session_for_channel(channel_id)?;
        match self.mark_disconnected(&session_id) {
            Ok(()) => Some(session_id),
            Err(e) => {
                debug!(channel_id = %channel_id, error = %e, "Channel closed for inactive session");
                None
            }
        }
    }

    /// Resume a session, cancelling any pending grace disposal.
    pub fn reconnect(&self, session_id: &str, channel_id: Option<String>) -> Result<()> {
        let session = self.live(session_id)?;
        let previous_channel = {
            let mut inner = session.inner.lock();
            if inner.state.is_terminating() {
                return Err(LifecycleError::disposed(EntityKind::Session, session_id));
            }
            inner.state = SessionState::Active;
            inner.disconnect_epoch += 1;
            inner.record_activity();
            match &channel_id {
                Some(channel_id) => inner.channel_id.replace(channel_id.clone()),
                None => None,
            }
        };

        if let Some(previous) = previous_channel
            && Some(&previous) != channel_id.as_ref()
        {
            self.index
                .channels
                .remove_if(&previous, |_, owner| owner == session_id);
        }
        if let Some(channel_id) = &channel_id {
            self.index
                .channels
                .insert(channel_id.clone(), session_id.to_string());
        }
        info!(session_id = %session_id, channel_id = ?channel_id, "Session reconnected");
        Ok(())
    }

    /// Tear a session down. Returns `false` if it was missing or already disposing.
    pub async fn dispose_session(&self, session_id: &str) -> bool {
        match self.get(session_id) {
            Some(session) => self.dispose_entry(session).await,
            None => false,
        }
    }

    /// Dispose expired sessions and mark inactive ones idle.
    pub async fn sweep(&self) -> SweepReport {
        let config = &self.index.config;
        let mut report = SweepReport::default();
        let mut expired = Vec::new();

        for session in self.snapshot() {
            let mut inner = session.inner.lock();
            if inner.state.is_terminating() {
                continue;
            }
            let inactive = inner.last_activity.elapsed();
            if inactive > config.session_timeout {
                expired.push(session.clone());
            } else if inner.state == SessionState::Active && inactive > config.idle_timeout {
                inner.state = SessionState::Idle;
                report.idled.push(session.session_id().to_string());
            }
        }

        expired.sort_by(|a, b| a.session_id().cmp(b.session_id()));
        for session in expired {
            let session_id = session.session_id().to_string();
            if self.dispose_entry(session).await {
                self.index.counters.expired.fetch_add(1, Ordering::Relaxed);
                report.expired.push(session_id);
            }
        }

        report.idled.sort();
        if !report.expired.is_empty() || !report.idled.is_empty() {
            info!(
                expired = report.expired.len(),
                idled = report.idled.len(),
                "Session sweep finished"
            );
        }
        report
    }

    /// Spawn the periodic sweep.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep().await;
                    }
                }
            }
            debug!("Session sweeper stopped");
        })
    }

    /// Shed sessions under memory pressure, least recently active first.
    pub async fn handle_pressure(&self, level: PressureLevel) -> Vec<String> {
        let shed_disconnected = match level {
            PressureLevel::Critical => true,
            PressureLevel::High => false,
            PressureLevel::Moderate | PressureLevel::Low => return Vec::new(),
        };

        let mut victims: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter_map(|session| {
                let inner = session.inner.lock();
                let eligible = match inner.state {
                    SessionState::Idle => true,
                    SessionState::Disconnected => shed_disconnected,
                    _ => false,
                };
                let last_activity = inner.last_activity;
                drop(inner);
                eligible.then_some((last_activity, session))
            })
            .collect();
        victims.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| a.1.session_id().cmp(b.1.session_id()))
        });

        let mut disposed = Vec::with_capacity(victims.len());
        for (_, session) in victims {
            let session_id = session.session_id().to_string();
            if self.dispose_entry(session).await {
                self.index.counters.shed.fetch_add(1, Ordering::Relaxed);
                disposed.push(session_id);
            }
        }
        if !disposed.is_empty() {
            warn!(
                pressure = %level,
                count = disposed.len(),
                "Disposed sessions under memory pressure"
            );
        }
        disposed
    }

    /// Dispose every session.
    pub async fn dispose_all(&self) -> usize {
        let mut sessions = self.snapshot();
        sessions.sort_by(|a, b| a.session_id().cmp(b.session_id()));
        let mut disposed = 0;
        for session in sessions {
            if self.dispose_entry(session).await {
                disposed += 1;
            }
        }
        if disposed > 0 {
            info!(count = disposed, "Disposed all sessions");
        }
        disposed
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .index
            .users
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn session_for_channel(&self, channel_id: &str) -> Option<String> {
        self.index
            .channels
            .get(channel_id)
            .map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.index.sessions.len()
    }

    pub fn stats(&self) -> SessionStats {
        let counters = &self.index.counters;
        let mut stats = SessionStats {
            created: counters.created.load(Ordering::Relaxed),
            disposed: counters.disposed.load(Ordering::Relaxed),
            expired: counters.expired.load(Ordering::Relaxed),
            shed_under_pressure: counters.shed.load(Ordering::Relaxed),
            ..Default::default()
        };
        for session in self.snapshot() {
            let inner = session.inner.lock();
            stats.total += 1;
            match inner.state {
                SessionState::Active => stats.active += 1,
                SessionState::Idle => stats.idle += 1,
                SessionState::Disconnected => stats.disconnected += 1,
                SessionState::CleaningUp | SessionState::Disposed => {}
            }
            stats.resources += inner.resources.len();
            stats.memory_usage += inner.memory_usage;
        }
        stats
    }

    /// A teardown that closes a client channel with the given status.
    pub fn channel_teardown(
        channel: Arc<dyn DuplexChannel>,
        code: u16,
        reason: impl Into<String>,
    ) -> Teardown {
        let reason = reason.into();
        let label = format!("channel:{}", channel.channel_id());
        Teardown::new(label, move || async move { channel.close(code, &reason).await })
    }

    fn live(&self, session_id: &str) -> Result<Arc<UserSession>> {
        self.get(session_id)
            .ok_or_else(|| LifecycleError::not_found(EntityKind::Session, session_id))
    }

    fn snapshot(&self) -> Vec<Arc<UserSession>> {
        self.index
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Start disposing `session`. The teardowns run on their own task, so a
    /// cancelled caller cannot leave the session stuck in `CleaningUp`.
    async fn dispose_entry(&self, session: Arc<UserSession>) -> bool {
        let (resources, callbacks, channel_id) = {
            let mut inner = session.inner.lock();
            if inner.state.is_terminating() {
                return false;
            }
            inner.state = SessionState::CleaningUp;
            (
                std::mem::take(&mut inner.resources),
                std::mem::take(&mut inner.callbacks),
                inner.channel_id.take(),
            )
        };

        let session_id = session.session_id().to_string();
        let index = self.index.clone();
        let resources: Vec<SessionResource> = resources.into_values().collect();
        let task = tokio::spawn(async move {
            index
                .finish_disposal(session, resources, callbacks, channel_id)
                .await;
        });
        if let Err(e) = task.await {
            warn!(session_id = %session_id, error = %e, "Session disposal task failed");
        }
        true
    }

    fn arm_grace_timer(&self, session: &Arc<UserSession>, epoch: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                session_id = %session.session_id(),
                "No Tokio runtime found for disconnect grace timer"
            );
            return;
        };

        let manager = self.clone();
        let weak: Weak<UserSession> = Arc::downgrade(session);
        let grace = self.index.config.disconnect_grace;
        let cancel = self.index.cancel.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            let Some(session) = weak.upgrade() else {
                return;
            };
            let expired = {
                let inner = session.inner.lock();
                inner.state == SessionState::Disconnected && inner.disconnect_epoch == epoch
            };
            if expired {
                info!(session_id = %session.session_id(), "Disconnect grace elapsed");
                manager.dispose_entry(session).await;
            }
        });
    }
}

async fn run_resource_teardown(session_id: &str, resource: SessionResource) {
    let Some(teardown) = resource.teardown else {
        return;
    };
    if let Err(e) = teardown.run().await {
        warn!(
            session_id = %session_id,
            resource_id = %resource.resource_id,
            kind = %resource.kind,
            error = %e,
            "Session resource teardown failed"
        );
    }
}
