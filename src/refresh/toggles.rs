//! Feature toggle providers.

use super::FeatureToggles;
use crate::core::LiveConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// In-memory toggles, shared by clones.
#[derive(Debug, Clone, Default)]
pub struct StaticToggles {
    flags: Arc<RwLock<HashMap<String, bool>>>,
}

impl StaticToggles {
    /// Create a provider with every toggle off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a toggle while building.
    pub fn with(self, name: impl Into<String>, enabled: bool) -> Self {
        self.set(name, enabled);
        self
    }

    /// Flip a toggle at runtime.
    pub fn set(&self, name: impl Into<String>, enabled: bool) {
        self.flags.write().insert(name.into(), enabled);
    }
}

#[async_trait]
impl FeatureToggles for StaticToggles {
    async fn is_enabled(&self, name: &str) -> bool {
        self.flags.read().get(name).copied().unwrap_or(false)
    }
}

/// Feature flags as loaded from configuration: a flat `name: bool` map.
///
/// Names match case-insensitively. Keys are lowercased on construction; when
/// two keys differ only in case, the flag is on if either is on.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "HashMap<String, bool>")]
pub struct FeatureFlags(HashMap<String, bool>);

impl FeatureFlags {
    /// Look up a flag. Unknown flags are off.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.0
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or(false)
    }
}

impl<K: AsRef<str>> FromIterator<(K, bool)> for FeatureFlags {
    fn from_iter<I: IntoIterator<Item = (K, bool)>>(iter: I) -> Self {
        let mut flags = HashMap::new();
        for (name, enabled) in iter {
            *flags
                .entry(name.as_ref().to_ascii_lowercase())
                .or_insert(false) |= enabled;
        }
        Self(flags)
    }
}

impl From<HashMap<String, bool>> for FeatureFlags {
    fn from(map: HashMap<String, bool>) -> Self {
        map.into_iter().collect()
    }
}

#[async_trait]
impl FeatureToggles for LiveConfig<FeatureFlags> {
    async fn is_enabled(&self, name: &str) -> bool {
        self.get().is_enabled(name)
    }
}
