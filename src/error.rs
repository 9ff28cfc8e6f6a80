//! Error types for config-change-subscriber.

use crate::broker::BrokerError;
use std::fmt;

/// Result type alias for subscriber operations.
pub type Result<T> = std::result::Result<T, SubscriberError>;

/// Errors that can occur while loading configuration or processing change notifications.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    /// Failed to load configuration from a source.
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    /// Failed to deserialize configuration.
    #[error("Failed to deserialize configuration: {0}")]
    DeserializationError(String),

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// The deployment environment has no broker connection mode.
    #[error("Environment not configured: {0}")]
    EnvironmentNotConfigured(String),

    /// The subscription could not be created or opened during startup.
    #[error("Failed to set up subscription '{subscription}' on topic '{topic}': {source}")]
    SubscriptionSetup {
        /// Topic the subscription belongs to
        topic: String,
        /// Subscription name
        subscription: String,
        /// Underlying broker failure
        #[source]
        source: BrokerError,
    },

    /// A broker operation failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A message body matched neither the vault-object nor the push-notification shape.
    #[error("Unknown message: {0}")]
    UnrecognizedEvent(String),

    /// A full configuration reload failed.
    #[error("Configuration reload failed: {0}")]
    ReloadFailed(String),

    /// The subscriber was started twice or stopped before starting.
    #[error("Invalid lifecycle transition: {0}")]
    Lifecycle(&'static str),

    /// IO error occurred.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error for other cases.
    #[error("Subscriber error: {0}")]
    Other(String),
}

/// Validation error for settings validation.
#[derive(Debug)]
pub enum ValidationError {
    /// Custom validation error with a message.
    Custom(String),

    /// A specific field has an invalid value.
    InvalidField {
        /// The field name/path
        field: String,
        /// The reason why it's invalid
        reason: String,
    },

    /// Multiple validation errors occurred.
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Create a custom validation error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    /// Create an invalid field error.
    pub fn invalid_field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Collapse a list of errors: `Ok` when empty, the single error when there is one.
    pub fn from_all(mut errors: Vec<ValidationError>) -> std::result::Result<(), Self> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom(msg) => write!(f, "{}", msg),
            Self::InvalidField { field, reason } => {
                write!(f, "Field '{}' is invalid: {}", field, reason)
            }
            Self::Multiple(errors) => {
                writeln!(f, "Multiple validation errors:")?;
                for (i, err) in errors.iter().enumerate() {
                    writeln!(f, "  {}. {}", i + 1, err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for SubscriberError {
    fn from(err: ValidationError) -> Self {
        SubscriberError::ValidationError(err.to_string())
    }
}
