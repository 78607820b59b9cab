//! Core data model: identities, auth keys and decisions, and the change
//! events the garbage collector and manager react to.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// First identity value handed out by the allocator. Values below it are
/// reserved, well-known identities (host, world, ...).
const MINIMAL_ALLOCATION_IDENTITY: u32 = 256;

/// Numeric security identity of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity(pub u32);

impl Identity {
    /// Returns `true` for reserved identities that never appear on the
    /// identity change stream.
    #[must_use]
    pub fn is_reserved(self) -> bool {
        self.0 < MINIMAL_ALLOCATION_IDENTITY
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for Identity {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Datapath identifier of a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u16);

impl NodeId {
    /// The local node. Entries keyed on it are never node-garbage-collected.
    pub const LOCAL: Self = Self(0);

    /// Returns `true` for the local node.
    #[must_use]
    pub fn is_local(self) -> bool {
        self == Self::LOCAL
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Authentication strategy selected by policy for an identity pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum AuthType {
    /// No authentication required.
    Disabled = 0,
    /// SPIFFE-backed mutual TLS.
    MutualTls = 1,
    /// Deny by policy.
    AlwaysFail = 2,
    /// Always succeeds.
    Null = 3,
}

impl AuthType {
    /// Stable lowercase name for logs and metrics.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::MutualTls => "mutual-tls",
            Self::AlwaysFail => "always-fail",
            Self::Null => "null",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for AuthType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::MutualTls),
            2 => Ok(Self::AlwaysFail),
            3 => Ok(Self::Null),
            other => Err(Error::Signal(format!("unknown auth type {other}"))),
        }
    }
}

/// One directional authentication relationship: the key into the auth table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuthKey {
    /// Identity of the local workload.
    pub local_identity: Identity,
    /// Identity of the remote workload.
    pub remote_identity: Identity,
    /// Node through which the remote workload is reached.
    pub remote_node_id: NodeId,
}

impl AuthKey {
    /// Create a key from raw parts.
    #[must_use]
    pub fn new(local: impl Into<Identity>, remote: impl Into<Identity>, node: NodeId) -> Self {
        Self {
            local_identity: local.into(),
            remote_identity: remote.into(),
            remote_node_id: node,
        }
    }

    /// Returns `true` if `identity` is either side of this key.
    #[must_use]
    pub fn references_identity(&self, identity: Identity) -> bool {
        self.local_identity == identity || self.remote_identity == identity
    }
}

impl fmt::Display for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}@{}",
            self.local_identity, self.remote_identity, self.remote_node_id
        )
    }
}

/// Value stored for an [`AuthKey`]: the flow is authenticated until `expiration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthInfo {
    /// Instant after which the decision no longer holds.
    pub expiration: DateTime<Utc>,
}

impl AuthInfo {
    /// Create a decision valid until `expiration`.
    #[must_use]
    pub fn new(expiration: DateTime<Utc>) -> Self {
        Self { expiration }
    }

    /// Returns `true` if the decision has lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }
}

/// A cluster node as seen on the node change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Resource name of the node.
    pub name: String,
    /// Datapath node id allocated for the node.
    pub id: NodeId,
}

/// Lifecycle event from a watched resource stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent<T> {
    /// Object created or updated.
    Upsert(T),
    /// Object deleted.
    Delete(T),
    /// All pre-existing objects have been replayed.
    Sync,
}

/// Emitted by certificate-backed handlers when trust material for an
/// identity changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertificateRotationEvent {
    /// Identity whose certificate rotated.
    pub identity: Identity,
    /// The identity was removed from the trust source entirely.
    pub deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn auth_type_round_trips_through_wire_byte() {
        for t in [
            AuthType::Disabled,
            AuthType::MutualTls,
            AuthType::AlwaysFail,
            AuthType::Null,
        ] {
            assert_eq!(AuthType::try_from(t as u8).unwrap(), t);
        }
        assert!(AuthType::try_from(42).is_err());
    }

    #[test]
    fn auth_key_references_both_sides() {
        let key = AuthKey::new(10, 20, NodeId(1));
        assert!(key.references_identity(Identity(10)));
        assert!(key.references_identity(Identity(20)));
        assert!(!key.references_identity(Identity(30)));
        assert_eq!(key.to_string(), "10->20@1");
    }

    #[test]
    fn expiry_is_inclusive_of_now() {
        let now = Utc::now();
        assert!(AuthInfo::new(now).is_expired_at(now));
        assert!(!AuthInfo::new(now + Duration::seconds(1)).is_expired_at(now));
    }

    #[test]
    fn reserved_identities_are_below_allocation_range() {
        assert!(Identity(2).is_reserved());
        assert!(!Identity(256).is_reserved());
        assert!(NodeId::LOCAL.is_local());
    }
}
