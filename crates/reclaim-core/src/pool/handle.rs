use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A type that can be recycled by [`super::ObjectPool`].
///
/// `initialize` must set every per-acquisition field and `reset` must clear
/// them, so a recycled instance never leaks data from its previous holder.
pub trait Poolable: Send + 'static {
    /// Arguments supplied on each acquisition.
    type Init;

    fn create() -> Self;

    fn initialize(&mut self, args: Self::Init);

    fn reset(&mut self);
}

/// Identity of one unit of work, issued per inbound message or tool call.
#[derive(Debug, Default)]
pub struct RequestHandle {
    pub request_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub attributes: HashMap<String, String>,
}

/// Arguments for [`RequestHandle`] acquisition.
#[derive(Debug, Clone, Default)]
pub struct RequestHandleInit {
    pub request_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

impl RequestHandleInit {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

impl RequestHandle {
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn is_clear(&self) -> bool {
        self.request_id.is_empty()
            && self.session_id.is_none()
            && self.user_id.is_none()
            && self.started_at.is_none()
            && self.attributes.is_empty()
    }
}

impl Poolable for RequestHandle {
    type Init = RequestHandleInit;

    fn create() -> Self {
        Self::default()
    }

    fn initialize(&mut self, args: RequestHandleInit) {
        self.request_id.clear();
        self.request_id.push_str(&args.request_id);
        self.session_id = args.session_id;
        self.user_id = args.user_id;
        self.started_at = Some(Utc::now());
        self.attributes.clear();
    }

    fn reset(&mut self) {
        // Keep the allocations, drop the contents.
        self.request_id.clear();
        self.session_id = None;
        self.user_id = None;
        self.started_at = None;
        self.attributes.clear();
    }
}
