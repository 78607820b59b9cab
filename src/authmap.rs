//! The shared, datapath-visible table of authentication decisions.
//!
//! The [`AuthMap`] trait abstracts over the table implementation. In an agent
//! it is backed by a kernel map pinned for the datapath; [`InMemoryAuthMap`]
//! is a `DashMap`-backed implementation for embedding and tests.
//!
//! Only [`crate::cache::AuthMapCache`] writes through this trait. Every other
//! component reads the cache.

use dashmap::DashMap;

use crate::Result;
use crate::types::{AuthInfo, AuthKey};

/// Trait abstracting the shared auth table.
///
/// Operations are synchronous: a table write is a single syscall-sized
/// operation and is issued while the cache holds the per-key lock.
pub trait AuthMap: Send + Sync + 'static {
    /// Insert or replace the decision for `key`.
    fn update(&self, key: &AuthKey, info: &AuthInfo) -> Result<()>;

    /// Remove the decision for `key`. Removing an absent key succeeds.
    fn delete(&self, key: &AuthKey) -> Result<()>;

    /// Read the decision for `key`.
    fn lookup(&self, key: &AuthKey) -> Result<Option<AuthInfo>>;

    /// Enumerate every decision in the table.
    fn entries(&self) -> Result<Vec<(AuthKey, AuthInfo)>>;
}

/// In-memory auth map backed by a `DashMap`.
#[derive(Debug, Default)]
pub struct InMemoryAuthMap {
    entries: DashMap<AuthKey, AuthInfo>,
}

impl InMemoryAuthMap {
    /// Create an empty auth map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an auth map pre-populated with `entries`, as if left behind by
    /// a previous process.
    #[must_use]
    pub fn with_entries(entries: impl IntoIterator<Item = (AuthKey, AuthInfo)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Number of decisions in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AuthMap for InMemoryAuthMap {
    fn update(&self, key: &AuthKey, info: &AuthInfo) -> Result<()> {
        self.entries.insert(*key, *info);
        Ok(())
    }

    fn delete(&self, key: &AuthKey) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn lookup(&self, key: &AuthKey) -> Result<Option<AuthInfo>> {
        Ok(self.entries.get(key).map(|e| *e.value()))
    }

    fn entries(&self) -> Result<Vec<(AuthKey, AuthInfo)>> {
        Ok(self
            .entries
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect())
    }
}
