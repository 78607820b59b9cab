//! Write-through cache over the shared auth map.
//!
//! [`AuthMapCache`] owns the in-memory view of every authentication decision.
//! Reads never touch the shared table. Writes go to the table first and are
//! applied in memory only once the table accepted them, so the cache never
//! claims an entry the datapath cannot see.
//!
//! # Serialization
//!
//! Each mutation runs while holding the `DashMap` entry lock for its key, and
//! the table write happens inside that critical section. Two mutations of the
//! same key are therefore linearizable; mutations of different keys only
//! contend when they share a shard. Handlers never run under this lock.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info};

use crate::Result;
use crate::authmap::AuthMap;
use crate::metrics;
use crate::types::{AuthInfo, AuthKey};

/// In-memory mirror of the shared auth map with write-through mutations.
pub struct AuthMapCache {
    /// Ground truth consulted by the datapath
    map: Arc<dyn AuthMap>,
    /// Mirror of `map`, keyed by auth key
    entries: DashMap<AuthKey, AuthInfo>,
}

impl AuthMapCache {
    /// Create an empty cache over `map`. Call [`restore`](Self::restore)
    /// before serving traffic.
    #[must_use]
    pub fn new(map: Arc<dyn AuthMap>) -> Self {
        Self {
            map,
            entries: DashMap::new(),
        }
    }

    /// Rebuild the in-memory view from the shared table.
    ///
    /// Returns the number of restored entries.
    ///
    /// # Errors
    ///
    /// Returns the table error if enumeration fails; the cache is left
    /// untouched in that case.
    pub fn restore(&self) -> Result<usize> {
        let restored = self.map.entries().inspect_err(|_| {
            metrics::record_map_error("restore");
        })?;

        self.entries.clear();
        let count = restored.len();
        for (key, info) in restored {
            self.entries.insert(key, info);
        }

        info!(entries = count, "Restored auth map cache");
        Ok(count)
    }

    /// Cached decision for `key`.
    #[must_use]
    pub fn get(&self, key: &AuthKey) -> Option<AuthInfo> {
        self.entries.get(key).map(|e| *e.value())
    }

    /// Snapshot of every cached decision.
    #[must_use]
    pub fn all(&self) -> Vec<(AuthKey, AuthInfo)> {
        self.entries
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect()
    }

    /// Number of cached decisions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no decision is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or refresh the decision for `key`.
    ///
    /// An existing later expiration is kept: re-authentication extends a
    /// decision, it never shortens it.
    ///
    /// # Errors
    ///
    /// Returns the table error; the cached value is unchanged in that case.
    pub fn insert(&self, key: AuthKey, info: AuthInfo) -> Result<()> {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                let current = *occupied.get();
                let merged = AuthInfo::new(current.expiration.max(info.expiration));
                self.write(&key, &merged)?;
                occupied.insert(merged);
            }
            Entry::Vacant(vacant) => {
                self.write(&key, &info)?;
                vacant.insert(info);
            }
        }
        Ok(())
    }

    /// Remove the decision for `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    ///
    /// Returns the table error; the cached value is kept in that case.
    pub fn delete(&self, key: &AuthKey) -> Result<()> {
        match self.entries.entry(*key) {
            Entry::Occupied(occupied) => {
                self.remove(key)?;
                occupied.remove();
            }
            Entry::Vacant(_) => {
                // Keep the table in line with the cache even if it somehow
                // holds a key we do not.
                self.remove(key)?;
            }
        }
        Ok(())
    }

    /// Remove every decision matching `predicate`.
    ///
    /// The predicate is re-evaluated under the key's lock, so an entry
    /// refreshed concurrently is not removed. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Stops at the first table error and returns it; entries removed before
    /// the failure stay removed.
    pub fn delete_if<F>(&self, predicate: F) -> Result<usize>
    where
        F: Fn(&AuthKey, &AuthInfo) -> bool,
    {
        let candidates: Vec<AuthKey> = self
            .entries
            .iter()
            .filter(|e| predicate(e.key(), e.value()))
            .map(|e| *e.key())
            .collect();

        let mut deleted = 0;
        for key in candidates {
            if let Entry::Occupied(occupied) = self.entries.entry(key) {
                if !predicate(occupied.key(), occupied.get()) {
                    continue;
                }
                self.remove(&key)?;
                occupied.remove();
                deleted += 1;
                debug!(key = %key, "Deleted auth map entry");
            }
        }
        Ok(deleted)
    }

    fn write(&self, key: &AuthKey, info: &AuthInfo) -> Result<()> {
        self.map.update(key, info).inspect_err(|e| {
            metrics::record_map_error("update");
            debug!(key = %key, error = %e, "Failed to write auth map entry");
        })
    }

    fn remove(&self, key: &AuthKey) -> Result<()> {
        self.map.delete(key).inspect_err(|e| {
            metrics::record_map_error("delete");
            debug!(key = %key, error = %e, "Failed to delete auth map entry");
        })
    }
}
