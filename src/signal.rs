//! Datapath signal boundary.
//!
//! The datapath raises an "authentication required" signal whenever it drops
//! a packet for lack of an auth table entry. The transport is external; this
//! module defines the record it delivers and the registration contract.

use bytes::Buf;
use tokio::sync::mpsc;

use crate::types::{AuthKey, AuthType, Identity, NodeId};
use crate::{Error, Result};

/// Signal kinds this crate subscribes to on the datapath signal transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SignalType {
    /// A flow needs authentication.
    AuthRequired,
}

/// One "authentication required" record as emitted by the datapath.
///
/// `auth_type` is kept raw: the datapath may be running a stale policy, and
/// the manager resolves the type afresh anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalAuthKey {
    /// Identity of the local workload.
    pub local_identity: u32,
    /// Identity of the remote workload.
    pub remote_identity: u32,
    /// Datapath id of the node hosting the remote workload.
    pub remote_node_id: u16,
    /// Auth type byte the datapath believes is required.
    pub auth_type: u8,
}

impl SignalAuthKey {
    /// Size of one record on the wire, including trailing padding.
    pub const WIRE_SIZE: usize = 12;

    /// Decode a little-endian datapath record.
    ///
    /// # Errors
    ///
    /// Returns `Error::Signal` if `buf` is shorter than [`Self::WIRE_SIZE`].
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::WIRE_SIZE {
            return Err(Error::Signal(format!(
                "auth signal record too short: {} of {} bytes",
                buf.len(),
                Self::WIRE_SIZE
            )));
        }
        let local_identity = buf.get_u32_le();
        let remote_identity = buf.get_u32_le();
        let remote_node_id = buf.get_u16_le();
        let auth_type = buf.get_u8();
        Ok(Self {
            local_identity,
            remote_identity,
            remote_node_id,
            auth_type,
        })
    }

    /// The auth type the datapath asked for, if it is a known one.
    ///
    /// # Errors
    ///
    /// Returns `Error::Signal` for an unknown type byte.
    pub fn requested_auth_type(&self) -> Result<AuthType> {
        AuthType::try_from(self.auth_type)
    }
}

impl From<SignalAuthKey> for AuthKey {
    fn from(signal: SignalAuthKey) -> Self {
        Self {
            local_identity: Identity(signal.local_identity),
            remote_identity: Identity(signal.remote_identity),
            remote_node_id: NodeId(signal.remote_node_id),
        }
    }
}

/// Registration contract of the signal transport.
pub trait SignalManager: Send + Sync {
    /// Deliver every signal of `signal_type` into `sender`.
    ///
    /// The transport must block (or drop, per its own policy) when the channel
    /// is full; it must never buffer without bound on our behalf.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal kind cannot be subscribed; callers treat
    /// this as fatal.
    fn register_handler(
        &self,
        signal_type: SignalType,
        sender: mpsc::Sender<SignalAuthKey>,
    ) -> Result<()>;
}
