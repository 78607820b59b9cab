//! Authentication request processing.
//!
//! [`AuthManager`] turns datapath signals and certificate rotations into
//! handler invocations and stores the outcome through [`AuthMapCache`].
//!
//! # Flow
//!
//! ```text
//! SignalAuthKey
//!   → AuthKey
//!   → skip if cached and unexpired, or already in flight
//!   → PolicyRepository::resolve_auth_type   (authoritative)
//!   → Disabled? delete entry, done
//!   → HandlerSet::get → AuthHandler::authenticate
//!   → Ok(expiration)  → AuthMapCache::insert
//!   → Err(_)          → AuthMapCache::delete
//! ```
//!
//! No lock is held across a handler call. Duplicate requests for one key are
//! collapsed through the in-flight set; everything else serializes on the
//! cache's per-key write path. A certificate rotation that finds its key in
//! flight marks it for refresh, and whoever holds the key re-authenticates
//! once more before letting go.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::{Error, Result};
use crate::cache::AuthMapCache;
use crate::handler::HandlerSet;
use crate::metrics::{self, Outcome};
use crate::policy::PolicyRepository;
use crate::signal::SignalAuthKey;
use crate::types::{AuthInfo, AuthKey, AuthType, CertificateRotationEvent};

/// Re-authentications run in parallel for one rotation event.
const ROTATION_CONCURRENCY: usize = 8;

/// Dispatches authentication requests to handlers and records the result.
pub struct AuthManager {
    handlers: HandlerSet,
    cache: Arc<AuthMapCache>,
    policy: Arc<dyn PolicyRepository>,
    /// Keys with an authentication currently running
    pending: DashSet<AuthKey>,
    /// Keys whose certificate rotated and still need a fresh authentication
    refresh: DashSet<AuthKey>,
}

/// Membership in the in-flight set, released on drop.
struct PendingGuard<'a> {
    pending: &'a DashSet<AuthKey>,
    key: AuthKey,
}

impl<'a> PendingGuard<'a> {
    fn acquire(pending: &'a DashSet<AuthKey>, key: AuthKey) -> Option<Self> {
        pending.insert(key).then_some(Self { pending, key })
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

impl AuthManager {
    /// Create a manager over a fixed handler set.
    #[must_use]
    pub fn new(
        handlers: HandlerSet,
        cache: Arc<AuthMapCache>,
        policy: Arc<dyn PolicyRepository>,
    ) -> Self {
        Self {
            handlers,
            cache,
            policy,
            pending: DashSet::new(),
            refresh: DashSet::new(),
        }
    }

    /// Handle one "authentication required" signal from the datapath.
    ///
    /// Signals for keys that are already authenticated, or already being
    /// authenticated, are dropped.
    ///
    /// # Errors
    ///
    /// Returns the policy, handler, or storage error. The key's entry has been
    /// removed in every error case except a failed removal itself.
    pub async fn handle_auth_request(&self, signal: SignalAuthKey) -> Result<()> {
        let key = AuthKey::from(signal);

        if let Some(info) = self.cache.get(&key)
            && !info.is_expired_at(Utc::now())
        {
            debug!(key = %key, expiration = %info.expiration, "Already authenticated, ignoring signal");
            return Ok(());
        }

        let Some(guard) = PendingGuard::acquire(&self.pending, key) else {
            debug!(key = %key, "Authentication already in flight, ignoring signal");
            return Ok(());
        };

        let result = self.authenticate_as(&key, Some(signal.auth_type)).await;
        drop(guard);
        self.drain_refresh(key).await;
        result
    }

    /// Re-authenticate, or drop, every entry referencing a rotated identity.
    ///
    /// Individual re-authentication failures are logged and leave no entry
    /// behind; they do not fail the event. Keys already being authenticated
    /// are marked, and the running authentication is followed by another one
    /// so a result issued under the old certificate does not stick.
    ///
    /// # Errors
    ///
    /// Returns the storage error if removing entries for a deleted identity
    /// fails.
    pub async fn handle_certificate_rotation_event(
        &self,
        event: CertificateRotationEvent,
    ) -> Result<()> {
        if event.deleted {
            let deleted = self
                .cache
                .delete_if(|key, _| key.references_identity(event.identity))?;
            info!(
                identity = %event.identity,
                deleted,
                "Certificate deleted, removed auth entries"
            );
            return Ok(());
        }

        let keys: Vec<AuthKey> = self
            .cache
            .all()
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.references_identity(event.identity))
            .collect();

        info!(
            identity = %event.identity,
            entries = keys.len(),
            "Certificate rotated, re-authenticating"
        );

        futures::stream::iter(keys)
            .for_each_concurrent(ROTATION_CONCURRENCY, |key| async move {
                self.refresh.insert(key);
                self.drain_refresh(key).await;
            })
            .await;

        Ok(())
    }

    /// Re-authenticate `key` until no refresh is outstanding for it.
    ///
    /// Gives up while another task holds `key`; that task calls this again
    /// after releasing it.
    async fn drain_refresh(&self, key: AuthKey) {
        while self.refresh.contains(&key) {
            let Some(_guard) = PendingGuard::acquire(&self.pending, key) else {
                debug!(key = %key, "Authentication in flight, deferring rotation refresh");
                return;
            };
            if self.refresh.remove(&key).is_some() {
                // Failures are already logged and the entry removed
                let _ = self.authenticate(&key).await;
            }
        }
    }

    /// Authenticate `key` unconditionally and store the outcome.
    ///
    /// # Errors
    ///
    /// Returns the policy, handler, or storage error.
    pub async fn authenticate(&self, key: &AuthKey) -> Result<()> {
        self.authenticate_as(key, None).await
    }

    async fn authenticate_as(&self, key: &AuthKey, requested: Option<u8>) -> Result<()> {
        let auth_type = match self
            .policy
            .resolve_auth_type(key.local_identity, key.remote_identity)
        {
            Ok(auth_type) => auth_type,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to resolve auth type");
                metrics::record_policy_failure();
                return self.fail(key, None, e);
            }
        };

        if let Some(raw) = requested {
            report_stale_signal(key, raw, auth_type);
        }

        if auth_type == AuthType::Disabled {
            debug!(key = %key, "Policy requires no authentication");
            metrics::record_authentication(auth_type, Outcome::Skipped);
            return self.cache.delete(key);
        }

        let handler = match self.handlers.get(auth_type) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(key = %key, auth_type = %auth_type, error = %e, "Dropping auth request");
                return self.fail(key, Some(auth_type), e);
            }
        };

        match handler.authenticate(key).await {
            Ok(expiration) => {
                if let Err(e) = self.cache.insert(*key, AuthInfo::new(expiration)) {
                    warn!(key = %key, error = %e, "Failed to store authentication result");
                    metrics::record_authentication(auth_type, Outcome::Failure);
                    return Err(e);
                }
                metrics::record_authentication(auth_type, Outcome::Success);
                debug!(
                    key = %key,
                    auth_type = %auth_type,
                    expiration = %expiration,
                    "Authenticated"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    key = %key,
                    auth_type = %auth_type,
                    category = e.category().as_str(),
                    error = %e,
                    "Failed to authenticate"
                );
                self.fail(key, Some(auth_type), e)
            }
        }
    }

    /// Remove any stale success for `key` and return `error`.
    ///
    /// Without an auth type the caller has already counted the failure.
    fn fail(&self, key: &AuthKey, auth_type: Option<AuthType>, error: Error) -> Result<()> {
        if let Some(auth_type) = auth_type {
            metrics::record_authentication(auth_type, Outcome::Failure);
        }
        if let Err(e) = self.cache.delete(key) {
            warn!(key = %key, error = %e, "Failed to remove auth entry after failure");
        }
        Err(error)
    }
}

fn report_stale_signal(key: &AuthKey, raw: u8, resolved: AuthType) {
    match AuthType::try_from(raw) {
        Ok(requested) if requested != resolved => debug!(
            key = %key,
            requested = %requested,
            resolved = %resolved,
            "Signal auth type differs from policy, using policy"
        ),
        Ok(_) => {}
        Err(_) => debug!(
            key = %key,
            requested = raw,
            resolved = %resolved,
            "Signal carries unknown auth type, using policy"
        ),
    }
}
