//! Garbage collection of auth map entries.
//!
//! Three independent triggers remove entries through [`AuthMapCache`]:
//!
//! - identity deletions drop entries naming the identity on either side
//! - node deletions drop entries reached through the node
//! - the periodic [`cleanup`](AuthMapGarbageCollector::cleanup) drops expired entries
//!
//! Entries restored at startup may reference identities or nodes deleted
//! while nothing was running. Both change streams replay existing objects
//! before emitting [`ResourceEvent::Sync`]; the collector remembers what it
//! saw until then and, on sync, removes entries referencing anything else.
//!
//! The collector only deletes. It never creates or extends an entry.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::Result;
use crate::cache::AuthMapCache;
use crate::metrics;
use crate::types::{AuthKey, Identity, Node, NodeId, ResourceEvent};

/// Replay bookkeeping for one change stream.
#[derive(Debug)]
struct SyncState<T> {
    synced: bool,
    seen: HashSet<T>,
}

impl<T: Eq + Hash> SyncState<T> {
    fn new() -> Self {
        Self {
            synced: false,
            seen: HashSet::new(),
        }
    }

    fn observe(&mut self, id: T) {
        if !self.synced {
            self.seen.insert(id);
        }
    }

    fn forget(&mut self, id: &T) {
        if !self.synced {
            self.seen.remove(id);
        }
    }

    /// Mark the stream synced and hand out what was seen during replay.
    /// Returns `None` if the stream was already synced.
    fn finish(&mut self) -> Option<HashSet<T>> {
        if self.synced {
            return None;
        }
        self.synced = true;
        Some(std::mem::take(&mut self.seen))
    }
}

/// Removes auth map entries that no longer describe a valid relationship.
pub struct AuthMapGarbageCollector {
    cache: Arc<AuthMapCache>,
    identities: Mutex<SyncState<Identity>>,
    nodes: Mutex<SyncState<NodeId>>,
}

impl AuthMapGarbageCollector {
    /// Create a collector over `cache`.
    #[must_use]
    pub fn new(cache: Arc<AuthMapCache>) -> Self {
        Self {
            cache,
            identities: Mutex::new(SyncState::new()),
            nodes: Mutex::new(SyncState::new()),
        }
    }

    /// React to one identity change. Returns the number of removed entries.
    ///
    /// # Errors
    ///
    /// Returns the first shared table error; remaining entries are picked up
    /// by the next trigger.
    pub fn handle_identity_change(&self, event: ResourceEvent<Identity>) -> Result<usize> {
        match event {
            ResourceEvent::Upsert(identity) => {
                self.identities.lock().observe(identity);
                Ok(0)
            }
            ResourceEvent::Delete(identity) => {
                self.identities.lock().forget(&identity);
                let deleted = self
                    .cache
                    .delete_if(|key, _| key.references_identity(identity))?;
                metrics::record_gc_deleted("identity", deleted);
                if deleted > 0 {
                    debug!(identity = %identity, deleted, "Removed auth entries of deleted identity");
                }
                Ok(deleted)
            }
            ResourceEvent::Sync => {
                let Some(alive) = self.identities.lock().finish() else {
                    return Ok(0);
                };
                let stale = |id: Identity| !id.is_reserved() && !alive.contains(&id);
                let deleted = self.cache.delete_if(|key, _| {
                    stale(key.local_identity) || stale(key.remote_identity)
                })?;
                metrics::record_gc_deleted("identity_sync", deleted);
                info!(
                    identities = alive.len(),
                    deleted, "Identity stream synced, removed entries of unknown identities"
                );
                Ok(deleted)
            }
        }
    }

    /// React to one node change. Returns the number of removed entries.
    ///
    /// # Errors
    ///
    /// Returns the first shared table error.
    pub fn handle_node_event(&self, event: ResourceEvent<Node>) -> Result<usize> {
        match event {
            ResourceEvent::Upsert(node) => {
                self.nodes.lock().observe(node.id);
                Ok(0)
            }
            ResourceEvent::Delete(node) => {
                self.nodes.lock().forget(&node.id);
                if node.id.is_local() {
                    debug!(node = %node.name, "Ignoring deletion of node without datapath id");
                    return Ok(0);
                }
                let deleted = self
                    .cache
                    .delete_if(|key, _| key.remote_node_id == node.id)?;
                metrics::record_gc_deleted("node", deleted);
                if deleted > 0 {
                    debug!(node = %node.name, node_id = %node.id, deleted, "Removed auth entries of deleted node");
                }
                Ok(deleted)
            }
            ResourceEvent::Sync => {
                let Some(alive) = self.nodes.lock().finish() else {
                    return Ok(0);
                };
                let deleted = self.cache.delete_if(|key: &AuthKey, _| {
                    !key.remote_node_id.is_local() && !alive.contains(&key.remote_node_id)
                })?;
                metrics::record_gc_deleted("node_sync", deleted);
                info!(
                    nodes = alive.len(),
                    deleted, "Node stream synced, removed entries of unknown nodes"
                );
                Ok(deleted)
            }
        }
    }

    /// Remove every entry whose expiration has passed.
    ///
    /// # Errors
    ///
    /// Returns the first shared table error.
    pub fn cleanup(&self) -> Result<usize> {
        let now = Utc::now();
        let deleted = self.cache.delete_if(|_, info| info.is_expired_at(now))?;
        metrics::record_gc_deleted("expiry", deleted);
        if deleted > 0 {
            debug!(deleted, "Removed expired auth entries");
        }
        Ok(deleted)
    }
}
