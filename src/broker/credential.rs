//! Broker credential resolution.

use crate::error::{Result, SubscriberError};
use crate::settings::{ChangeSubscriptionSettings, RuntimeEnvironment, RuntimeSettings};
use std::fmt;

/// How the subscriber authenticates against the broker.
///
/// Resolved once at startup from the deployment environment; nothing in the
/// message-processing path branches on the environment afterwards.
#[derive(Clone, PartialEq, Eq)]
pub enum BrokerCredential {
    /// Shared access connection string (development)
    ConnectionString(String),
    /// Managed identity against a namespace host (production)
    ManagedIdentity {
        /// Fully qualified namespace, e.g. `myns.servicebus.windows.net`
        namespace: String,
        /// User-assigned identity client id; system-assigned when `None`
        client_id: Option<String>,
    },
}

impl BrokerCredential {
    /// Resolve the credential for the current environment.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The environment has no connection mode (Test, Ppe)
    /// - Development has no connection string
    /// - Production has no namespace
    pub fn resolve(
        runtime: &RuntimeSettings,
        settings: &ChangeSubscriptionSettings,
    ) -> Result<Self> {
        match runtime.environment {
            RuntimeEnvironment::Development => settings
                .service_bus_connection_string
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| Self::ConnectionString(s.to_string()))
                .ok_or_else(|| {
                    SubscriberError::EnvironmentNotConfigured(
                        "Development requires service_bus_connection_string".to_string(),
                    )
                }),
            RuntimeEnvironment::Production => {
                let namespace = settings.namespace().ok_or_else(|| {
                    SubscriberError::EnvironmentNotConfigured(
                        "Production requires service_bus_namespace".to_string(),
                    )
                })?;
                Ok(Self::ManagedIdentity {
                    namespace,
                    client_id: runtime.managed_identity_client_id.clone(),
                })
            }
            other => Err(SubscriberError::EnvironmentNotConfigured(other.to_string())),
        }
    }

    /// The namespace endpoint this credential targets.
    pub fn endpoint(&self) -> Option<String> {
        match self {
            Self::ConnectionString(conn) => conn
                .split(';')
                .filter_map(|part| part.split_once('='))
                .find(|(key, _)| key.trim().eq_ignore_ascii_case("Endpoint"))
                .map(|(_, value)| {
                    value
                        .trim()
                        .trim_start_matches("sb://")
                        .trim_end_matches('/')
                        .to_string()
                }),
            Self::ManagedIdentity { namespace, .. } => Some(namespace.clone()),
        }
    }
}

// Connection strings embed the shared access key; never print them.
impl fmt::Debug for BrokerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionString(_) => f
                .debug_tuple("ConnectionString")
                .field(&self.endpoint().unwrap_or_default())
                .finish(),
            Self::ManagedIdentity {
                namespace,
                client_id,
            } => f
                .debug_struct("ManagedIdentity")
                .field("namespace", namespace)
                .field("client_id", client_id)
                .finish(),
        }
    }
}
