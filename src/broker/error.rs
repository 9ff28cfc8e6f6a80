//! Broker transport errors.

/// Errors reported by the broker's management or data plane.
///
/// Brokers report most failures as free text, so classification helpers look at
/// both the variant and the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// The topic or subscription does not exist (anymore).
    #[error("The messaging entity '{0}' could not be found.")]
    EntityNotFound(String),

    /// An entity with the same name already exists.
    #[error("The messaging entity '{0}' already exists.")]
    AlreadyExists(String),

    /// The message lock expired or the message was already settled.
    #[error("The lock supplied is invalid or expired for message '{0}'")]
    LockLost(String),

    /// The credential was rejected.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Any other transport-level failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Whether this error means the subscription (or its topic) is gone.
    pub fn is_entity_not_found(&self) -> bool {
        match self {
            Self::EntityNotFound(_) => true,
            other => {
                let text = other.to_string();
                text.contains("The messaging entity") && text.contains("not be found")
            }
        }
    }

    /// Whether this error is a create/delete race that should count as success.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Self::AlreadyExists(_) => true,
            other => other.to_string().contains("already exists"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_not_found_by_variant() {
        let err = BrokerError::EntityNotFound("changes/Subscriptions/api-host1".to_string());
        assert!(err.is_entity_not_found());
        assert!(!err.is_already_exists());
    }

    #[test]
    fn test_entity_not_found_by_text() {
        let err = BrokerError::Transport(
            "The messaging entity 'ns:Topic:changes|api-host1' could not be found. TrackingId:abc"
                .to_string(),
        );
        assert!(err.is_entity_not_found());
    }

    #[test]
    fn test_unrelated_transport_error() {
        let err = BrokerError::Transport("connection reset by peer".to_string());
        assert!(!err.is_entity_not_found());
        assert!(!err.is_already_exists());
    }

    #[test]
    fn test_already_exists_by_text() {
        let err = BrokerError::Transport("Entity 'changes/api-host1' already exists.".to_string());
        assert!(err.is_already_exists());
    }
}
