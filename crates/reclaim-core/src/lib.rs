//! Memory and resource lifecycle core for multi-tenant chat and agent servers.
//!
//! The crate keeps long-running servers inside their memory budget while many
//! users share them:
//!
//! - [`monitor`] samples memory and classifies pressure.
//! - [`pool`] recycles short-lived request handles.
//! - [`components`] loads expensive shared components on demand and sheds
//!   them under pressure.
//! - [`scope`] owns everything created for one request.
//! - [`session`] owns everything a connected user holds.
//!
//! [`LifecycleContext`] wires them together, runs the background tasks and
//! shuts everything down in order.

pub mod components;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod pool;
pub mod scope;
pub mod session;

pub use components::{
    ComponentDefinition, ComponentPriority, LazyComponentRegistry, LoadOutcome, LoadStrategy,
};
pub use config::LifecycleConfig;
pub use context::{LifecycleContext, PressureResponse, ShutdownReport};
pub use error::{EntityKind, LifecycleError, Result};
pub use monitor::{MemoryMonitor, MemoryStats, PressureLevel};
pub use pool::{ObjectPool, Poolable, Pooled, RequestHandle};
pub use scope::{RequestScope, RequestScopeManager, ScopeGuard};
pub use session::{SessionLifecycleManager, SessionState, UserSession};

pub use reclaim_traits::{Component, DuplexChannel, MemoryProbe, Teardown};
