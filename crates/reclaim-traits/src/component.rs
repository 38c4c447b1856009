//! Lazily constructed components.

use std::any::Any;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Converts a shared component into `Arc<dyn Any>` for typed access.
///
/// Blanket-implemented for every `Send + Sync + 'static` type, so component
/// authors never write it by hand.
pub trait AsAny: Any + Send + Sync {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// An expensively constructed, globally named object.
///
/// `shutdown` is the conventional cleanup hook: the registry calls it on
/// unload after the definition's own teardown callback.
#[async_trait]
pub trait Component: AsAny {
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
