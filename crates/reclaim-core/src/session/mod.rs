//! User session lifecycle.
//!
//! Sessions span a user's connected lifetime and own every resource attached
//! to them. They move from Active through Idle and Disconnected to Disposed;
//! a disconnected session survives a grace period so a quick reconnect keeps
//! its resources.

mod manager;
mod types;

pub use manager::{SessionConfig, SessionLifecycleManager};
pub use types::{SessionInfo, SessionResource, SessionState, SessionStats, SweepReport, UserSession};
