//! Deployment runtime settings.

use crate::error::{Result, SubscriberError};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Environment variable naming the deployment environment.
pub const ENVIRONMENT_VARIABLE: &str = "ASPNETCORE_ENVIRONMENT";

/// Deployment environment the service runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum RuntimeEnvironment {
    /// Local development, connection-string credentials
    #[default]
    Development,
    /// Production, managed identity credentials
    Production,
    /// Test environment
    Test,
    /// Pre-production environment
    #[serde(rename = "PPE")]
    Ppe,
}

impl FromStr for RuntimeEnvironment {
    type Err = SubscriberError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            "ppe" => Ok(Self::Ppe),
            other => Err(SubscriberError::EnvironmentNotConfigured(format!(
                "unknown environment '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RuntimeEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Development => "Development",
            Self::Production => "Production",
            Self::Test => "Test",
            Self::Ppe => "PPE",
        };
        f.write_str(name)
    }
}

/// Runtime facts decided once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RuntimeSettings {
    /// Current deployment environment
    pub environment: RuntimeEnvironment,
    /// Client id of the user-assigned managed identity, if any
    pub managed_identity_client_id: Option<String>,
}

impl RuntimeSettings {
    /// Runtime settings for an explicit environment.
    pub fn new(environment: RuntimeEnvironment) -> Self {
        Self {
            environment,
            managed_identity_client_id: None,
        }
    }

    /// Read the environment from [`ENVIRONMENT_VARIABLE`], defaulting to Development.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable names an unknown environment.
    pub fn from_env() -> Result<Self> {
        Self::from_name(std::env::var(ENVIRONMENT_VARIABLE).ok().as_deref())
    }

    /// Resolve from an optional environment name; unset or empty means Development.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is not a known environment.
    pub fn from_name(name: Option<&str>) -> Result<Self> {
        let environment = match name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => name.parse()?,
            None => RuntimeEnvironment::Development,
        };
        Ok(Self::new(environment))
    }

    /// Attach a managed identity client id.
    pub fn with_managed_identity(mut self, client_id: impl Into<String>) -> Self {
        self.managed_identity_client_id = Some(client_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!(
            "production".parse::<RuntimeEnvironment>().unwrap(),
            RuntimeEnvironment::Production
        );
        assert_eq!(
            "PPE".parse::<RuntimeEnvironment>().unwrap(),
            RuntimeEnvironment::Ppe
        );
        assert!("Staging".parse::<RuntimeEnvironment>().is_err());
    }

    #[test]
    fn test_unset_defaults_to_development() {
        assert_eq!(
            RuntimeSettings::from_name(None).unwrap().environment,
            RuntimeEnvironment::Development
        );
        assert_eq!(
            RuntimeSettings::from_name(Some("  ")).unwrap().environment,
            RuntimeEnvironment::Development
        );
    }

    #[test]
    fn test_display_round_trips() {
        for env in [
            RuntimeEnvironment::Development,
            RuntimeEnvironment::Production,
            RuntimeEnvironment::Test,
            RuntimeEnvironment::Ppe,
        ] {
            assert_eq!(env.to_string().parse::<RuntimeEnvironment>().unwrap(), env);
        }
    }

    #[test]
    fn test_with_managed_identity() {
        let runtime =
            RuntimeSettings::new(RuntimeEnvironment::Production).with_managed_identity("abc");
        assert_eq!(runtime.managed_identity_client_id.as_deref(), Some("abc"));
    }
}
