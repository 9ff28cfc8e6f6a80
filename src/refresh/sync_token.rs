//! Configuration store sync tokens.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Header carrying sync tokens in both directions.
pub const SYNC_TOKEN_HEADER: &str = "Sync-Token";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    value: String,
    sequence: u64,
}

/// Latest sync token per replica, shared between whoever learns about
/// changes and the source that reads the store.
///
/// Tokens have the form `id=value;sn=sequence`; several may be joined by
/// commas. For each id only the highest sequence number is kept. Sending
/// [`header_value`](Self::header_value) with a read makes the store answer
/// at least as fresh as every recorded change.
///
/// ```rust
/// use config_change_subscriber::refresh::SyncTokens;
///
/// let tokens = SyncTokens::new();
/// tokens.record("zAJw6V16=NjoxOSM0NjQ4MTI3;sn=464812");
/// assert_eq!(tokens.header_value().as_deref(), Some("zAJw6V16=NjoxOSM0NjQ4MTI3"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SyncTokens {
    tokens: Arc<RwLock<HashMap<String, Token>>>,
}

impl SyncTokens {
    /// Create an empty token set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every well-formed token in `raw`. Returns how many were
    /// accepted as newer than what was known.
    pub fn record(&self, raw: &str) -> usize {
        let mut accepted = 0;
        let mut tokens = self.tokens.write();

        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((id, token)) = parse(part) else {
                tracing::trace!(token = part, "ignoring malformed sync token");
                continue;
            };
            let newer = tokens
                .get(&id)
                .is_none_or(|known| token.sequence > known.sequence);
            if newer {
                tokens.insert(id, token);
                accepted += 1;
            }
        }
        accepted
    }

    /// Value for the `Sync-Token` request header, or `None` if nothing was
    /// recorded yet.
    pub fn header_value(&self) -> Option<String> {
        let tokens = self.tokens.read();
        if tokens.is_empty() {
            return None;
        }

        let mut parts: Vec<String> = tokens
            .iter()
            .map(|(id, token)| format!("{}={}", id, token.value))
            .collect();
        parts.sort();
        Some(parts.join(","))
    }

    /// Whether no token was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

/// `id=value;sn=42` -> (`id`, value and sequence)
fn parse(part: &str) -> Option<(String, Token)> {
    let (id_value, sequence) = part.split_once(";sn=")?;
    let (id, value) = id_value.split_once('=')?;
    let sequence = sequence.trim().parse().ok()?;

    if id.is_empty() || value.is_empty() {
        return None;
    }
    Some((
        id.to_string(),
        Token {
            value: value.to_string(),
            sequence,
        },
    ))
}
