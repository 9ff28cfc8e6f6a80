//! The change-notification subscriber.
//!
//! Control flow:
//! 1. [`SubscriptionManager`] makes sure the per-instance subscription exists.
//! 2. [`MessageLoop`] attaches to it; each message goes through
//!    [`EventClassifier`] and [`RefreshDispatcher`], then is completed or
//!    abandoned.
//! 3. Channel errors go to [`RecoveryHandler`], which recreates the
//!    subscription and restarts the loop when the broker reports it gone.
//!
//! [`ChangeSubscriber`] wires these together for a host.

mod classifier;
mod dispatcher;
mod manager;
mod message_loop;
mod recovery;
mod service;

pub use classifier::{
    ChangeEvent, EventClassifier, EventEnvelope, VaultEventKind, VaultObjectEvent, VaultObjectType,
};
pub use dispatcher::{RefreshDispatcher, RefreshOutcome, SkipReason};
pub use manager::SubscriptionManager;
pub use message_loop::{LoopHandle, MessageHandler, MessageLoop};
pub use recovery::{ChannelHealth, ESCALATE_AFTER_ATTEMPTS, RecoveryDecision, RecoveryHandler};
pub use service::{ChangeSubscriber, ChangeSubscriberBuilder};
