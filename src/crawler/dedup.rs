//! Session-scoped deduplication of natural keys

use crate::url::{NormalizationPolicy, Normalizer};
use std::collections::HashSet;
use std::sync::Mutex;
use tracing::debug;

/// Set of natural keys seen during one session
///
/// Keys are normalized before the check. The set only grows and is dropped
/// with the session; cross-session uniqueness is the sink's job.
pub struct Deduplicator {
    normalizer: Normalizer,
    seen: Mutex<HashSet<String>>,
}

impl Deduplicator {
    pub fn new(normalizer: Normalizer) -> Self {
        Self {
            normalizer,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_policy(policy: NormalizationPolicy) -> Self {
        Self::new(policy.normalizer())
    }

    /// Normalizes a raw key, or `None` if the rule rejects it
    pub fn normalize(&self, raw: &str) -> Option<String> {
        match (self.normalizer)(raw) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!("Cannot normalize '{}': {}", raw, e);
                None
            }
        }
    }

    /// Records `key` and returns true if it was not seen before
    ///
    /// Returns false, without changing anything, for a repeat. A key the
    /// normalizer rejects is checked as given.
    pub fn seen(&self, key: &str) -> bool {
        let key = self.normalize(key).unwrap_or_else(|| key.trim().to_string());

        // Normalization happens before the lock is taken
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        seen.insert(key)
    }

    pub fn len(&self) -> usize {
        match self.seen.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
