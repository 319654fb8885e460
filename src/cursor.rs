//! Per-feed cursors used for delta detection.
//!
//! A cursor is the last state a feed has been synchronized to. The sampler
//! reads it before each comparison and overwrites it after every observation,
//! whether or not the resulting change was delivered.

use crate::types::Fingerprint;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Value stored under a cursor key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CursorValue {
    /// Monotonic position in a stream (e.g. total trace lines seen).
    Position(u64),
    /// Fingerprint of the last observed collection.
    Fingerprint(Fingerprint),
    /// Raw snapshot of the last observed bytes.
    Bytes(Vec<u8>),
}

impl CursorValue {
    pub fn as_position(&self) -> Option<u64> {
        match self {
            CursorValue::Position(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_fingerprint(&self) -> Option<Fingerprint> {
        match self {
            CursorValue::Fingerprint(fp) => Some(*fp),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            CursorValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// Thread-safe map from feed key to cursor value.
#[derive(Debug, Default)]
pub struct CursorTracker {
    cursors: RwLock<HashMap<String, CursorValue>>,
}

impl CursorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored value for `key`, or `default` if nothing has been recorded.
    pub fn get(&self, key: &str, default: CursorValue) -> CursorValue {
        self.cursors.read().get(key).cloned().unwrap_or(default)
    }

    pub fn get_opt(&self, key: &str) -> Option<CursorValue> {
        self.cursors.read().get(key).cloned()
    }

    /// Overwrite the cursor for `key`. Last write wins.
    pub fn set(&self, key: impl Into<String>, value: CursorValue) {
        self.cursors.write().insert(key.into(), value);
    }

    /// Clear a single key, or every key when `key` is `None`.
    pub fn reset(&self, key: Option<&str>) {
        let mut cursors = self.cursors.write();
        match key {
            Some(k) => {
                cursors.remove(k);
            }
            None => cursors.clear(),
        }
    }

    /// Copy of every cursor currently held.
    pub fn snapshot(&self) -> HashMap<String, CursorValue> {
        self.cursors.read().clone()
    }

    pub fn len(&self) -> usize {
        self.cursors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.read().is_empty()
    }
}
