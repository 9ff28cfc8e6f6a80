//! Settings consumed by the subscriber.

mod runtime;
mod subscription;

pub use runtime::{ENVIRONMENT_VARIABLE, RuntimeEnvironment, RuntimeSettings};
pub use subscription::{ChangeSubscriptionSettings, DEFAULT_MAX_STALENESS};
