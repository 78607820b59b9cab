//! Mutual TLS authentication between workload identities.
//!
//! # Architecture
//!
//! ```text
//! AuthKey{local, remote, node}
//!   → CertificateProvider: certificate for `local` (SPIRE-issued)
//!   → PeerHandshake: TLS to `node`, SNI "<remote>.<trust-domain>"
//!   → CertIdentity extracted from the peer leaf
//!   → peer SPIFFE ID must be spiffe://<trust-domain>/identity/<remote>
//!   → expiration = min(local.not_after, peer.not_after)
//! ```
//!
//! # Modules
//!
//! - [`config`]: `MutualAuthConfig`
//! - [`identity`]: X.509 identity extraction (`CertIdentity`, `SpiffeId`)
//! - [`handler`]: `MutualAuthHandler` and its collaborator traits

pub mod config;
pub mod handler;
pub mod identity;

pub use config::MutualAuthConfig;
pub use handler::{CertificateProvider, IdentityCertificate, MutualAuthHandler, PeerHandshake};
pub use identity::{CertIdentity, SpiffeId, server_name_for_identity};
