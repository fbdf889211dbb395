//! Run-wide `_key` registry.
//!
//! Every entity and relationship key added during a run passes through
//! [`DuplicateKeyTracker::register_key`]. A key may be registered once; a
//! second registration, or a different key that normalizes to the same
//! canonical value, fails with [`DuplicateKeyError`].
//!
//! Registration is an atomic check-and-set under one lock, so two
//! concurrent registrations of the same key can never both succeed. Callers
//! that check [`DuplicateKeyTracker::has_key`] first and register later do
//! not get that guarantee: another producer may register the key in between.

use crate::core::BigMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

const DUPLICATE_KEY_SHARD_SIZE: usize = 2_000_000;

/// What the tracker remembers about a registered key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMetadata {
    /// `_type` of the object that registered the key.
    pub object_type: String,
    /// The key as it was registered, before normalization.
    pub key: String,
}

impl KeyMetadata {
    pub fn new(key: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self {
            object_type: object_type.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "Duplicate _key detected (_key={key}, _type={object_type}, existing _key={existing_key}, existing _type={existing_type})"
)]
pub struct DuplicateKeyError {
    pub key: String,
    pub object_type: String,
    pub existing_key: String,
    pub existing_type: String,
}

type NormalizeFn = dyn Fn(&str) -> String + Send + Sync;

pub struct DuplicateKeyTracker {
    normalize: Option<Arc<NormalizeFn>>,
    keys: RwLock<BigMap<String, KeyMetadata>>,
}

impl fmt::Debug for DuplicateKeyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplicateKeyTracker")
            .field("normalized", &self.normalize.is_some())
            .field("len", &self.len())
            .finish()
    }
}

impl Default for DuplicateKeyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DuplicateKeyTracker {
    /// Creates a tracker that compares keys as-is.
    pub fn new() -> Self {
        Self {
            normalize: None,
            keys: RwLock::new(BigMap::new(DUPLICATE_KEY_SHARD_SIZE)),
        }
    }

    /// Creates a tracker that compares keys after `normalize`.
    ///
    /// ```
    /// use integrator::tracking::{DuplicateKeyTracker, KeyMetadata};
    ///
    /// let tracker = DuplicateKeyTracker::with_normalization(|key| key.to_lowercase());
    /// tracker.register_key("User:1", KeyMetadata::new("User:1", "acme_user")).unwrap();
    ///
    /// assert!(tracker.has_key("user:1"));
    /// assert!(tracker.register_key("USER:1", KeyMetadata::new("USER:1", "acme_user")).is_err());
    /// ```
    pub fn with_normalization<F>(normalize: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self {
            normalize: Some(Arc::new(normalize)),
            keys: RwLock::new(BigMap::new(DUPLICATE_KEY_SHARD_SIZE)),
        }
    }

    fn normalized(&self, key: &str) -> String {
        match &self.normalize {
            Some(normalize) => normalize(key),
            None => key.to_string(),
        }
    }

    /// Registers a key, failing if its normalized form is already present.
    pub fn register_key(&self, key: &str, metadata: KeyMetadata) -> Result<(), DuplicateKeyError> {
        let normalized = self.normalized(key);
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = keys.get(normalized.as_str()) {
            return Err(DuplicateKeyError {
                key: key.to_string(),
                object_type: metadata.object_type,
                existing_key: existing.key.clone(),
                existing_type: existing.object_type.clone(),
            });
        }

        keys.insert(normalized, metadata);
        Ok(())
    }

    pub fn has_key(&self, key: &str) -> bool {
        let normalized = self.normalized(key);
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(normalized.as_str())
    }

    pub fn metadata(&self, key: &str) -> Option<KeyMetadata> {
        let normalized = self.normalized(key);
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(normalized.as_str())
            .cloned()
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
