//! Lazily loaded, globally named components.

mod definition;
mod registry;

pub use definition::{
    ComponentDefinition, ComponentFactory, ComponentInstance, ComponentPriority,
    ComponentTeardown, DeferredLoad, LoadOutcome, LoadStrategy,
};
pub use registry::{
    ComponentInfo, LazyComponentRegistry, PreloadReport, RegistryConfig, RegistryStats,
};
