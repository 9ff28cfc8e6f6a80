//! Live configuration: layered loading, lock-free snapshots, full reloads.

mod builder;
mod listeners;
mod live_config;
mod loader;

#[cfg(feature = "validation")]
mod validation;

pub use builder::LiveConfigBuilder;
pub use listeners::{ChangeListeners, ListenerHandle};
pub use live_config::LiveConfig;
pub(crate) use loader::ConfigLoader;

#[cfg(feature = "validation")]
pub use validation::Validate;
