//! Policy boundary: which auth type an identity pair requires.

use crate::Result;
use crate::types::{AuthType, Identity};

/// Read-only view of the policy repository.
///
/// Consulted on every authentication attempt. Results are never cached here
/// because policy can change at any time.
pub trait PolicyRepository: Send + Sync + 'static {
    /// Auth type required for traffic from `local` to `remote`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Policy` if the pair cannot be resolved.
    fn resolve_auth_type(&self, local: Identity, remote: Identity) -> Result<AuthType>;
}
