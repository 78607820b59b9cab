//! Enable-gated wiring of the authentication subsystem.
//!
//! [`MeshAuth::start`] is the only place that knows how the pieces fit:
//!
//! ```text
//! restore cache ─▶ register signal queue ─▶ start jobs
//!                                            ├─ auth-request        (spawning observer)
//!                                            ├─ reauth-<auth type>  (one per rotating handler)
//!                                            ├─ gc-identity         (observer)
//!                                            ├─ gc-node             (observer, optional)
//!                                            └─ gc-expiry           (timer)
//! ```
//!
//! With `auth.enabled = false` nothing is constructed and no resource is
//! acquired.

use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use crate::Result;
use crate::authmap::AuthMap;
use crate::cache::AuthMapCache;
use crate::config::MeshAuthConfig;
use crate::gc::AuthMapGarbageCollector;
use crate::handler::{AuthHandler, HandlerSet};
use crate::jobs::JobGroup;
use crate::manager::AuthManager;
use crate::policy::PolicyRepository;
use crate::signal::{SignalManager, SignalType};
use crate::types::{AuthType, Identity, Node, ResourceEvent};

/// Collaborators handed to [`MeshAuth::start`].
pub struct MeshAuthParams {
    /// Subsystem configuration.
    pub config: MeshAuthConfig,
    /// Shared, datapath-visible auth table.
    pub auth_map: Arc<dyn AuthMap>,
    /// One handler per supported auth type.
    pub handlers: Vec<Arc<dyn AuthHandler>>,
    /// Source of required auth types.
    pub policy: Arc<dyn PolicyRepository>,
    /// Datapath signal transport.
    pub signal_manager: Arc<dyn SignalManager>,
    /// Identity lifecycle events.
    pub identity_changes: BoxStream<'static, ResourceEvent<Identity>>,
    /// Node lifecycle events. Without it, node deletions are left to the
    /// expiry sweep.
    pub node_changes: Option<BoxStream<'static, ResourceEvent<Node>>>,
}

/// Running authentication subsystem.
pub struct MeshAuth {
    cache: Arc<AuthMapCache>,
    manager: Arc<AuthManager>,
    gc: Arc<AuthMapGarbageCollector>,
    jobs: JobGroup,
}

impl MeshAuth {
    /// Build and start every component.
    ///
    /// Returns `Ok(None)` when authentication is disabled. Must be called
    /// from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails without starting any job if the configuration is invalid
    /// (`Error::Config`), the handler set is invalid, the cache cannot be
    /// restored, or the signal queue cannot be registered.
    pub async fn start(params: MeshAuthParams) -> Result<Option<Self>> {
        let MeshAuthParams {
            config,
            auth_map,
            handlers,
            policy,
            signal_manager,
            identity_changes,
            node_changes,
        } = params;

        if !config.enabled {
            info!("Authentication processing is disabled");
            return Ok(None);
        }
        config.validate()?;

        let handlers = HandlerSet::new(handlers)?;
        let rotations: Vec<_> = handlers
            .iter()
            .filter_map(|h| h.subscribe_to_rotated_identities().map(|rx| (h.auth_type(), rx)))
            .collect();

        let cache = Arc::new(AuthMapCache::new(auth_map));
        cache.restore()?;

        let (signals_tx, signals_rx) = mpsc::channel(config.queue_size);
        signal_manager.register_handler(SignalType::AuthRequired, signals_tx)?;

        let manager = Arc::new(AuthManager::new(handlers, cache.clone(), policy));
        let gc = Arc::new(AuthMapGarbageCollector::new(cache.clone()));
        let mut jobs = JobGroup::new(config.shutdown_timeout);

        let m = manager.clone();
        jobs.add_spawning_observer(
            "auth-request",
            signals_rx,
            config.max_concurrent_authentications,
            move |signal| {
                let m = m.clone();
                async move {
                    if let Err(e) = m.handle_auth_request(signal).await {
                        debug!(error = %e, category = e.category().as_str(), "Auth request dropped");
                    }
                }
            },
        );

        for (auth_type, rx) in rotations {
            let m = manager.clone();
            jobs.add_observer(reauth_job_name(auth_type), BroadcastStream::new(rx), move |event| {
                let m = m.clone();
                async move {
                    match event {
                        Ok(event) => {
                            if let Err(e) = m.handle_certificate_rotation_event(event).await {
                                warn!(error = %e, "Failed to handle certificate rotation");
                            }
                        }
                        Err(BroadcastStreamRecvError::Lagged(missed)) => {
                            warn!(missed, "Certificate rotation events were dropped");
                        }
                    }
                }
            });
        }

        let g = gc.clone();
        jobs.add_observer("gc-identity", identity_changes, move |event| {
            let g = g.clone();
            async move {
                if let Err(e) = g.handle_identity_change(event) {
                    warn!(error = %e, "Failed to garbage collect after identity change");
                }
            }
        });

        if let Some(node_changes) = node_changes {
            let g = gc.clone();
            jobs.add_observer("gc-node", node_changes, move |event| {
                let g = g.clone();
                async move {
                    if let Err(e) = g.handle_node_event(event) {
                        warn!(error = %e, "Failed to garbage collect after node change");
                    }
                }
            });
        }

        let g = gc.clone();
        jobs.add_timer("gc-expiry", config.gc_interval, move || {
            let g = g.clone();
            async move {
                if let Err(e) = g.cleanup() {
                    warn!(error = %e, "Failed to remove expired auth entries");
                }
            }
        });

        info!(
            entries = cache.len(),
            jobs = jobs.len(),
            queue_size = config.queue_size,
            "Authentication processing started"
        );

        Ok(Some(Self {
            cache,
            manager,
            gc,
            jobs,
        }))
    }

    /// The write-through cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<AuthMapCache> {
        &self.cache
    }

    /// The request processor.
    #[must_use]
    pub fn manager(&self) -> &Arc<AuthManager> {
        &self.manager
    }

    /// The garbage collector.
    #[must_use]
    pub fn garbage_collector(&self) -> &Arc<AuthMapGarbageCollector> {
        &self.gc
    }

    /// Stop every job. The signal queue is closed, so the transport sees
    /// send errors from here on.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` if jobs had to be aborted.
    pub async fn stop(self) -> Result<()> {
        info!("Stopping authentication processing");
        self.jobs.shutdown().await
    }
}

fn reauth_job_name(auth_type: AuthType) -> &'static str {
    match auth_type {
        AuthType::Disabled => "reauth-disabled",
        AuthType::MutualTls => "reauth-mutual-tls",
        AuthType::AlwaysFail => "reauth-always-fail",
        AuthType::Null => "reauth-null",
    }
}
