//! Error types for the lifecycle core.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// What kind of entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Component,
    Session,
    Scope,
    Resource,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EntityKind::Component => "Component",
            EntityKind::Session => "Session",
            EntityKind::Scope => "Request scope",
            EntityKind::Resource => "Resource",
        };
        f.write_str(label)
    }
}

/// Lifecycle error types.
///
/// Only [`LifecycleError::NotFound`] and [`LifecycleError::Disposed`] are
/// expected to reach request-handling code. Pressure deferrals are not errors,
/// see [`crate::components::LoadOutcome`].
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("{kind} already disposed: {id}")]
    Disposed { kind: EntityKind, id: String },

    #[error("Circular dependency detected involving: {0}")]
    CircularDependency(String),

    #[error("Timed out after {waited:?} waiting for component '{name}' to load")]
    LoadTimeout { name: String, waited: Duration },

    #[error("Component '{name}' failed to load: {source}")]
    LoadFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Type mismatch for '{name}': expected {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

impl LifecycleError {
    pub(crate) fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn disposed(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::Disposed {
            kind,
            id: id.into(),
        }
    }

    /// Whether a caller may reasonably retry the same operation later.
    ///
    /// Disposed-state errors are fatal to the current operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::LoadTimeout { .. } | LifecycleError::LoadFailed { .. }
        )
    }
}

/// Result type alias for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;
