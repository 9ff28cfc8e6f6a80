//! Configuration source implementations.

mod config_source;
mod env;
mod file;

#[cfg(feature = "remote")]
mod remote;

pub use config_source::ConfigSource;
pub use env::EnvSource;
pub use file::FileSource;

#[cfg(feature = "remote")]
pub use remote::{RemoteStoreSource, RemoteStoreSourceBuilder};
