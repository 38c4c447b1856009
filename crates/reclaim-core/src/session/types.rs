use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reclaim_traits::Teardown;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Session lifecycle state.
///
/// Active and Idle alternate with activity; a closed channel moves the session
/// to Disconnected; disposal passes through CleaningUp into the terminal
/// Disposed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Idle,
    Disconnected,
    CleaningUp,
    Disposed,
}

impl SessionState {
    /// Whether the session is being or has been torn down.
    pub fn is_terminating(&self) -> bool {
        matches!(self, SessionState::CleaningUp | SessionState::Disposed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Disconnected => "disconnected",
            SessionState::CleaningUp => "cleaning_up",
            SessionState::Disposed => "disposed",
        };
        f.write_str(label)
    }
}

/// A resource owned by exactly one session.
pub struct SessionResource {
    pub resource_id: String,
    pub kind: String,
    pub instance: Arc<dyn Any + Send + Sync>,
    pub created_at: DateTime<Utc>,
    pub teardown: Option<Teardown>,
    pub memory_estimate: u64,
}

impl fmt::Debug for SessionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionResource")
            .field("resource_id", &self.resource_id)
            .field("kind", &self.kind)
            .field("created_at", &self.created_at)
            .field("teardown", &self.teardown.as_ref().map(Teardown::label))
            .field("memory_estimate", &self.memory_estimate)
            .finish_non_exhaustive()
    }
}

pub(super) struct SessionInner {
    pub channel_id: Option<String>,
    pub state: SessionState,
    pub last_activity: Instant,
    pub last_activity_at: DateTime<Utc>,
    pub resources: HashMap<String, SessionResource>,
    pub callbacks: Vec<Teardown>,
    pub memory_usage: u64,
    /// Bumped on every disconnect and reconnect; grace timers compare it.
    pub disconnect_epoch: u64,
}

impl SessionInner {
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }
}

/// A user's connected lifetime on the server.
pub struct UserSession {
    session_id: String,
    user_id: String,
    thread_id: Option<String>,
    created_at: DateTime<Utc>,
    pub(super) inner: Mutex<SessionInner>,
}

impl UserSession {
    pub(super) fn new(
        session_id: String,
        user_id: String,
        thread_id: Option<String>,
        channel_id: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            thread_id,
            created_at: now,
            inner: Mutex::new(SessionInner {
                channel_id,
                state: SessionState::Active,
                last_activity: Instant::now(),
                last_activity_at: now,
                resources: HashMap::new(),
                callbacks: Vec::new(),
                memory_usage: 0,
                disconnect_epoch: 0,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn channel_id(&self) -> Option<String> {
        self.inner.lock().channel_id.clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.lock().last_activity.elapsed()
    }

    pub fn memory_usage(&self) -> u64 {
        self.inner.lock().memory_usage
    }

    pub fn resource_count(&self) -> usize {
        self.inner.lock().resources.len()
    }

    pub fn info(&self) -> SessionInfo {
        let inner = self.inner.lock();
        let mut resources: Vec<String> = inner.resources.keys().cloned().collect();
        resources.sort();
        SessionInfo {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            thread_id: self.thread_id.clone(),
            channel_id: inner.channel_id.clone(),
            state: inner.state,
            created_at: self.created_at,
            last_activity_at: inner.last_activity_at,
            resources,
            memory_usage: inner.memory_usage,
        }
    }
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Serializable session snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub thread_id: Option<String>,
    pub channel_id: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub resources: Vec<String>,
    pub memory_usage: u64,
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Sessions disposed for exceeding the session timeout.
    pub expired: Vec<String>,
    /// Active sessions marked idle.
    pub idled: Vec<String>,
}

/// Aggregate session counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub disconnected: usize,
    pub resources: usize,
    pub memory_usage: u64,
    pub created: u64,
    pub disposed: u64,
    pub expired: u64,
    pub shed_under_pressure: u64,
}
