//! Reclaim Traits - Seams between the lifecycle core and its collaborators.
//!
//! This crate provides the interfaces the core consumes but never implements
//! for production itself:
//! - MemoryProbe and MemoryReading (OS/runtime memory query)
//! - DuplexChannel (already-connected client channel, referenced via teardown)
//! - Component (lazily constructed instances with optional async shutdown)
//! - Teardown (one-shot cleanup callbacks, sync or async)

pub mod channel;
pub mod component;
pub mod memory;
pub mod teardown;

// ── Top-level re-exports ─────────────────────────────────────────────

pub use channel::DuplexChannel;
pub use component::{AsAny, Component};
pub use memory::{MemoryProbe, MemoryReading, ProbeError};
pub use teardown::Teardown;
