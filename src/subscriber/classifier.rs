//! Classification of raw notification bodies into change events.

use crate::refresh::PushNotification;
use serde_json::{Map, Value};
use std::fmt;

/// Kind of vault object a notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultObjectType {
    /// A secret
    Secret,
    /// A certificate
    Certificate,
}

impl VaultObjectType {
    fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "secret" => Some(Self::Secret),
            "certificate" => Some(Self::Certificate),
            _ => None,
        }
    }
}

/// Lifecycle event reported for a vault object, derived from the event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultEventKind {
    /// A new version is available (`...NewVersionCreated`)
    NewVersionCreated,
    /// The current version expires soon (`...NearExpiry`)
    NearExpiry,
    /// The current version expired (`...Expired`)
    Expired,
    /// Any other vault event
    Other,
}

impl VaultEventKind {
    /// Derive the kind from an event type such as
    /// `Microsoft.KeyVault.SecretNewVersionCreated`.
    pub fn from_event_type(event_type: &str) -> Self {
        if event_type.ends_with("NewVersionCreated") {
            Self::NewVersionCreated
        } else if event_type.ends_with("NearExpiry") {
            Self::NearExpiry
        } else if event_type.ends_with("Expired") {
            Self::Expired
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for VaultEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NewVersionCreated => "NewVersionCreated",
            Self::NearExpiry => "NearExpiry",
            Self::Expired => "Expired",
            Self::Other => "Other",
        };
        f.write_str(name)
    }
}

/// A secret or certificate lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultObjectEvent {
    /// Normalized object type
    pub object_type: VaultObjectType,
    /// `ObjectType` exactly as received
    pub object_type_name: String,
    /// Vault the object lives in
    pub vault_name: String,
    /// Name of the secret or certificate
    pub object_name: String,
    /// Lifecycle event
    pub kind: VaultEventKind,
    /// Envelope event type
    pub event_type: String,
    /// Envelope subject
    pub subject: String,
}

/// A classified notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A vault secret or certificate changed
    VaultObjectChanged(VaultObjectEvent),
    /// Cached configuration should be considered stale
    GenericPushNotification(PushNotification),
    /// The body matched neither shape; carries the reason
    Unrecognized(String),
}

impl ChangeEvent {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::VaultObjectChanged(_) => "vault-object",
            Self::GenericPushNotification(_) => "push-notification",
            Self::Unrecognized(_) => "unrecognized",
        }
    }
}

/// Envelope common to every notification: event type, subject and data.
///
/// Field names match case-insensitively (`eventType`, `EventType`, ...). A
/// batch holding exactly one event is accepted as that event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Event id, if present
    pub id: Option<String>,
    /// Event type
    pub event_type: String,
    /// Subject, usually the URI of the changed resource
    pub subject: String,
    /// Event payload; a JSON-encoded string payload is decoded
    pub data: Value,
}

impl EventEnvelope {
    /// Parse an envelope from a message body.
    ///
    /// # Errors
    ///
    /// Returns a description of why the body is not an envelope.
    pub fn parse(body: &[u8]) -> Result<Self, String> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| format!("body is not JSON: {}", e))?;

        let value = match value {
            Value::Array(mut batch) if batch.len() == 1 => batch.remove(0),
            Value::Array(batch) => {
                return Err(format!("expected a single event, got a batch of {}", batch.len()));
            }
            other => other,
        };

        let Value::Object(object) = value else {
            return Err("body is not a JSON object".to_string());
        };

        let event_type = string_field(&object, "eventType")
            .ok_or_else(|| "envelope has no EventType".to_string())?;
        let subject = string_field(&object, "subject")
            .ok_or_else(|| "envelope has no Subject".to_string())?;
        let id = string_field(&object, "id");

        let data = match field(&object, "data") {
            Some(Value::String(encoded)) => {
                serde_json::from_str(encoded).unwrap_or_else(|_| Value::String(encoded.clone()))
            }
            Some(data) => data.clone(),
            None => Value::Null,
        };

        Ok(Self {
            id,
            event_type,
            subject,
            data,
        })
    }

    /// The vault-object payload, if the data has one.
    fn vault_object(&self) -> Option<VaultObjectEvent> {
        let Value::Object(data) = &self.data else {
            return None;
        };

        let object_name = string_field(data, "objectName").filter(|name| !name.is_empty())?;
        let object_type_name = string_field(data, "objectType")?;
        let object_type = VaultObjectType::parse(&object_type_name)?;

        Some(VaultObjectEvent {
            object_type,
            object_type_name,
            vault_name: string_field(data, "vaultName").unwrap_or_default(),
            object_name,
            kind: VaultEventKind::from_event_type(&self.event_type),
            event_type: self.event_type.clone(),
            subject: self.subject.clone(),
        })
    }

    /// The push notification, if the envelope is a configuration store event.
    fn push_notification(&self) -> Option<PushNotification> {
        let Value::Object(data) = &self.data else {
            return None;
        };
        let sync_token = string_field(data, "syncToken")?;
        PushNotification::new(sync_token, self.event_type.clone(), self.subject.clone())
    }
}

/// Turns raw message bodies into [`ChangeEvent`]s.
///
/// The vault-object shape is checked first; a body matching both shapes is a
/// vault event.
///
/// ```rust
/// use config_change_subscriber::subscriber::{ChangeEvent, EventClassifier};
///
/// let body = br#"{
///     "eventType": "Microsoft.KeyVault.SecretNewVersionCreated",
///     "subject": "db-pass",
///     "data": { "ObjectType": "Secret", "VaultName": "kv-prod", "ObjectName": "db-pass" }
/// }"#;
///
/// match EventClassifier::new().classify(body) {
///     ChangeEvent::VaultObjectChanged(event) => assert_eq!(event.object_name, "db-pass"),
///     other => panic!("unexpected {:?}", other),
/// }
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct EventClassifier;

impl EventClassifier {
    /// Create a classifier.
    pub fn new() -> Self {
        Self
    }

    /// Classify a message body.
    pub fn classify(&self, body: &[u8]) -> ChangeEvent {
        let envelope = match EventEnvelope::parse(body) {
            Ok(envelope) => envelope,
            Err(reason) => return ChangeEvent::Unrecognized(reason),
        };
        self.classify_envelope(&envelope)
    }

    /// Classify an already parsed envelope.
    pub fn classify_envelope(&self, envelope: &EventEnvelope) -> ChangeEvent {
        if let Some(event) = envelope.vault_object() {
            return ChangeEvent::VaultObjectChanged(event);
        }
        if let Some(notification) = envelope.push_notification() {
            return ChangeEvent::GenericPushNotification(notification);
        }
        ChangeEvent::Unrecognized(format!(
            "event '{}' for '{}' is neither a vault object event nor a push notification",
            envelope.event_type, envelope.subject
        ))
    }
}

fn field<'a>(object: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    object
        .get(name)
        .or_else(|| {
            object
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
}

fn string_field(object: &Map<String, Value>, name: &str) -> Option<String> {
    field(object, name)
        .and_then(Value::as_str)
        .map(str::to_string)
}
