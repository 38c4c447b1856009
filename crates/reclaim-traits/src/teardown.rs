//! One-shot cleanup callbacks.

use std::fmt;
use std::future::Future;

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;

type TeardownFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A cleanup action that runs at most once.
///
/// Scopes and sessions collect these and run them when they are disposed.
/// A failing teardown is reported to the caller of [`Teardown::run`]; the
/// containers log it and carry on with the remaining callbacks.
pub struct Teardown {
    label: String,
    action: TeardownFn,
}

impl Teardown {
    /// Wrap an async cleanup closure.
    pub fn new<F, Fut>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            label: label.into(),
            action: Box::new(move || action().boxed()),
        }
    }

    /// Wrap a synchronous cleanup closure.
    pub fn sync<F>(label: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            label: label.into(),
            action: Box::new(move || futures::future::ready(action()).boxed()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Consume the callback and run it.
    pub async fn run(self) -> Result<()> {
        (self.action)().await
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
