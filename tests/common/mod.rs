//! Fakes shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mesh_auth::authmap::{AuthMap, InMemoryAuthMap};
use mesh_auth::config::MeshAuthConfig;
use mesh_auth::handler::AuthHandler;
use mesh_auth::policy::PolicyRepository;
use mesh_auth::signal::{SignalAuthKey, SignalManager, SignalType};
use mesh_auth::types::{
    AuthInfo, AuthKey, AuthType, CertificateRotationEvent, Identity, Node, ResourceEvent,
};
use mesh_auth::{Error, MeshAuthParams, Result};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

/// Policy that requires the same auth type for every pair.
pub struct StaticPolicy(pub AuthType);

impl PolicyRepository for StaticPolicy {
    fn resolve_auth_type(&self, _local: Identity, _remote: Identity) -> Result<AuthType> {
        Ok(self.0)
    }
}

/// Signal transport that hands the registered queue to the test.
#[derive(Default)]
pub struct RecordingSignalManager {
    sender: Mutex<Option<mpsc::Sender<SignalAuthKey>>>,
    pub refuse: bool,
}

impl RecordingSignalManager {
    pub fn refusing() -> Self {
        Self {
            sender: Mutex::new(None),
            refuse: true,
        }
    }

    /// The auth-required queue, if one was registered.
    pub fn sender(&self) -> Option<mpsc::Sender<SignalAuthKey>> {
        self.sender.lock().clone()
    }
}

impl SignalManager for RecordingSignalManager {
    fn register_handler(
        &self,
        signal_type: SignalType,
        sender: mpsc::Sender<SignalAuthKey>,
    ) -> Result<()> {
        if self.refuse {
            return Err(Error::Signal(format!("{signal_type:?} is not available")));
        }
        assert_eq!(signal_type, SignalType::AuthRequired);
        *self.sender.lock() = Some(sender);
        Ok(())
    }
}

/// Handler returning `now + valid_for`, optionally emitting rotations.
pub struct FixedExpiryHandler {
    pub auth_type: AuthType,
    pub valid_for: Mutex<chrono::Duration>,
    pub calls: AtomicUsize,
    pub rotations: Option<broadcast::Sender<CertificateRotationEvent>>,
}

impl FixedExpiryHandler {
    pub fn new(auth_type: AuthType, valid_for: chrono::Duration) -> Self {
        Self {
            auth_type,
            valid_for: Mutex::new(valid_for),
            calls: AtomicUsize::new(0),
            rotations: None,
        }
    }

    pub fn rotating(auth_type: AuthType, valid_for: chrono::Duration) -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            rotations: Some(tx),
            ..Self::new(auth_type, valid_for)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthHandler for FixedExpiryHandler {
    fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    async fn authenticate(&self, _key: &AuthKey) -> Result<DateTime<Utc>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Utc::now() + *self.valid_for.lock())
    }

    fn subscribe_to_rotated_identities(
        &self,
    ) -> Option<broadcast::Receiver<CertificateRotationEvent>> {
        self.rotations.as_ref().map(broadcast::Sender::subscribe)
    }
}

/// Handler that reports each start and then waits for a permit.
pub struct GatedHandler {
    pub gate: Arc<Semaphore>,
    started: mpsc::UnboundedSender<AuthKey>,
}

impl GatedHandler {
    pub fn new() -> (Self, Arc<Semaphore>, mpsc::UnboundedReceiver<AuthKey>) {
        let gate = Arc::new(Semaphore::new(0));
        let (started, rx) = mpsc::unbounded_channel();
        (
            Self {
                gate: gate.clone(),
                started,
            },
            gate,
            rx,
        )
    }
}

#[async_trait]
impl AuthHandler for GatedHandler {
    fn auth_type(&self) -> AuthType {
        AuthType::MutualTls
    }

    async fn authenticate(&self, key: &AuthKey) -> Result<DateTime<Utc>> {
        let _ = self.started.send(*key);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| Error::Authentication("gate closed".into()))?;
        permit.forget();
        Ok(Utc::now() + chrono::Duration::hours(1))
    }
}

/// Auth map whose every operation fails.
pub struct FailingAuthMap;

impl AuthMap for FailingAuthMap {
    fn update(&self, _key: &AuthKey, _info: &AuthInfo) -> Result<()> {
        Err(Error::AuthMap("map unavailable".into()))
    }

    fn delete(&self, _key: &AuthKey) -> Result<()> {
        Err(Error::AuthMap("map unavailable".into()))
    }

    fn lookup(&self, _key: &AuthKey) -> Result<Option<AuthInfo>> {
        Err(Error::AuthMap("map unavailable".into()))
    }

    fn entries(&self) -> Result<Vec<(AuthKey, AuthInfo)>> {
        Err(Error::AuthMap("map unavailable".into()))
    }
}

/// Test-side ends of the change streams handed to `MeshAuth`.
pub struct Streams {
    pub identities: mpsc::Sender<ResourceEvent<Identity>>,
    pub nodes: mpsc::Sender<ResourceEvent<Node>>,
}

/// Assemble start parameters around fresh change streams.
pub fn params(
    config: MeshAuthConfig,
    auth_map: Arc<dyn AuthMap>,
    handlers: Vec<Arc<dyn AuthHandler>>,
    policy: AuthType,
    signals: Arc<RecordingSignalManager>,
) -> (MeshAuthParams, Streams) {
    let (identities, identity_rx) = mpsc::channel(16);
    let (nodes, node_rx) = mpsc::channel(16);
    let params = MeshAuthParams {
        config,
        auth_map,
        handlers,
        policy: Arc::new(StaticPolicy(policy)),
        signal_manager: signals,
        identity_changes: ReceiverStream::new(identity_rx).boxed(),
        node_changes: Some(ReceiverStream::new(node_rx).boxed()),
    };
    (params, Streams { identities, nodes })
}

/// Empty in-memory table.
pub fn empty_map() -> Arc<InMemoryAuthMap> {
    Arc::new(InMemoryAuthMap::new())
}

/// Datapath record for `local → remote` via `node`.
pub fn signal(local: u32, remote: u32, node: u16) -> SignalAuthKey {
    SignalAuthKey {
        local_identity: local,
        remote_identity: remote,
        remote_node_id: node,
        auth_type: AuthType::MutualTls as u8,
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met within 5s");
}
