//! Concurrency-safe map of source key to cursor token.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use crate::types::CursorToken;

/// Owns every cursor record and serializes access to them.
///
/// Records are created lazily on first access and never removed. Writes to
/// the same key are serialized by the inner lock and the last write wins;
/// concurrent first access for different keys is safe.
///
/// Share it between cycles with an `Arc`; there is no global instance.
#[derive(Debug, Default)]
pub struct CursorStore {
    cursors: RwLock<HashMap<String, CursorToken>>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last recorded token for `key`, or the empty token if the
    /// key is unseen. An unseen key gets an empty record.
    pub fn get(&self, key: &str) -> CursorToken {
        {
            let cursors = self.cursors.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = cursors.get(key) {
                return token.clone();
            }
        }

        let mut cursors = self.cursors.write().unwrap_or_else(PoisonError::into_inner);
        cursors.entry(key.to_string()).or_default().clone()
    }

    /// Replaces the token for `key`.
    pub fn set(&self, key: &str, token: CursorToken) {
        let mut cursors = self.cursors.write().unwrap_or_else(PoisonError::into_inner);
        match cursors.get_mut(key) {
            Some(existing) => *existing = token,
            None => {
                cursors.insert(key.to_string(), token);
            }
        }
    }

    /// Number of keys with a record (including empty ones).
    pub fn len(&self) -> usize {
        self.cursors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every record, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, CursorToken> {
        self.cursors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
