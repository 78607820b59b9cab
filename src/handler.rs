//! Auth handlers: one strategy per [`AuthType`].
//!
//! The manager never knows how a flow is authenticated. It resolves the
//! required [`AuthType`] from policy, looks the matching handler up in a
//! [`HandlerSet`], and stores whatever expiration the handler returns.
//!
//! Built-in handlers:
//!
//! - [`NullAuthHandler`]: always succeeds, never expires
//! - [`AlwaysFailAuthHandler`]: always fails (deny by policy)
//! - [`crate::mtls::MutualAuthHandler`]: SPIFFE-backed mutual TLS

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::types::{AuthKey, AuthType, CertificateRotationEvent};
use crate::{Error, Result};

/// Capability set of one authentication strategy.
///
/// Implementations must be `Send + Sync` because a single handler serves
/// concurrent requests.
#[async_trait]
pub trait AuthHandler: Send + Sync + 'static {
    /// The auth type this handler is responsible for.
    fn auth_type(&self) -> AuthType;

    /// Authenticate `key`, returning the instant the decision expires.
    ///
    /// May block on external handshakes.
    async fn authenticate(&self, key: &AuthKey) -> Result<DateTime<Utc>>;

    /// Stream of identities whose trust material changed out-of-band.
    ///
    /// Only certificate-backed handlers return `Some`.
    fn subscribe_to_rotated_identities(
        &self,
    ) -> Option<broadcast::Receiver<CertificateRotationEvent>> {
        None
    }
}

/// Immutable auth-type → handler lookup table, populated once at startup.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: HashMap<AuthType, Arc<dyn AuthHandler>>,
}

impl HandlerSet {
    /// Build the table.
    ///
    /// # Errors
    ///
    /// Returns `Error::DuplicateHandler` if two handlers claim the same auth
    /// type, and `Error::Config` if a handler claims [`AuthType::Disabled`].
    pub fn new(handlers: impl IntoIterator<Item = Arc<dyn AuthHandler>>) -> Result<Self> {
        let mut map: HashMap<AuthType, Arc<dyn AuthHandler>> = HashMap::new();
        for handler in handlers {
            let auth_type = handler.auth_type();
            if auth_type == AuthType::Disabled {
                return Err(Error::Config(
                    "auth handlers cannot be registered for auth type disabled".into(),
                ));
            }
            if map.insert(auth_type, handler).is_some() {
                return Err(Error::DuplicateHandler(auth_type));
            }
        }
        Ok(Self { handlers: map })
    }

    /// Look up the handler for `auth_type`.
    ///
    /// # Errors
    ///
    /// Returns `Error::HandlerNotFound` for unregistered types.
    pub fn get(&self, auth_type: AuthType) -> Result<&Arc<dyn AuthHandler>> {
        self.handlers
            .get(&auth_type)
            .ok_or(Error::HandlerNotFound(auth_type))
    }

    /// Iterate registered handlers.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn AuthHandler>> {
        self.handlers.values()
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Succeeds for every key; the decision never expires.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuthHandler;

#[async_trait]
impl AuthHandler for NullAuthHandler {
    fn auth_type(&self) -> AuthType {
        AuthType::Null
    }

    async fn authenticate(&self, _key: &AuthKey) -> Result<DateTime<Utc>> {
        Ok(DateTime::<Utc>::MAX_UTC)
    }
}

/// Fails every key.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysFailAuthHandler;

#[async_trait]
impl AuthHandler for AlwaysFailAuthHandler {
    fn auth_type(&self) -> AuthType {
        AuthType::AlwaysFail
    }

    async fn authenticate(&self, key: &AuthKey) -> Result<DateTime<Utc>> {
        Err(Error::Authentication(format!(
            "{key}: failing on purpose (auth type always-fail)"
        )))
    }
}
