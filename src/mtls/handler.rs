//! SPIFFE-backed mutual TLS auth handler.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use super::config::MutualAuthConfig;
use super::identity::{CertIdentity, server_name_for_identity};
use crate::handler::AuthHandler;
use crate::types::{AuthKey, AuthType, CertificateRotationEvent, Identity, NodeId};
use crate::{Error, Result};

/// Certificate chain and key for one workload identity.
#[derive(Clone)]
pub struct IdentityCertificate {
    /// DER-encoded chain, leaf first.
    pub chain: Vec<Vec<u8>>,
    /// DER-encoded PKCS#8 private key of the leaf.
    pub private_key: Vec<u8>,
}

impl IdentityCertificate {
    /// The leaf certificate, if the chain is non-empty.
    #[must_use]
    pub fn leaf(&self) -> Option<&[u8]> {
        self.chain.first().map(Vec::as_slice)
    }
}

impl fmt::Debug for IdentityCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCertificate")
            .field("chain_len", &self.chain.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Source of workload certificates (a SPIRE agent in production).
#[async_trait]
pub trait CertificateProvider: Send + Sync + 'static {
    /// Current certificate for `identity`.
    async fn certificate_for_identity(&self, identity: Identity) -> Result<IdentityCertificate>;

    /// Notifications for identities whose certificate rotated or was removed.
    fn subscribe_to_rotated_identities(&self) -> broadcast::Receiver<CertificateRotationEvent>;
}

/// Transport that performs the TLS handshake with a remote node.
#[async_trait]
pub trait PeerHandshake: Send + Sync + 'static {
    /// Connect to `remote_node`, present `local`, request `server_name`, and
    /// return the DER of the leaf certificate the peer presented.
    ///
    /// Implementations must verify the peer's full chain against the trust
    /// domain's bundle and fail the handshake otherwise. [`MutualAuthHandler`]
    /// only checks the identity in the returned leaf and its validity.
    async fn handshake(
        &self,
        local: &IdentityCertificate,
        remote_node: NodeId,
        server_name: &str,
    ) -> Result<Vec<u8>>;
}

/// Auth handler for [`AuthType::MutualTls`].
pub struct MutualAuthHandler {
    config: MutualAuthConfig,
    certificates: Arc<dyn CertificateProvider>,
    handshake: Arc<dyn PeerHandshake>,
}

impl MutualAuthHandler {
    /// Create a handler over a certificate source and handshake transport.
    #[must_use]
    pub fn new(
        config: MutualAuthConfig,
        certificates: Arc<dyn CertificateProvider>,
        handshake: Arc<dyn PeerHandshake>,
    ) -> Self {
        Self {
            config,
            certificates,
            handshake,
        }
    }

    fn verify_peer(&self, key: &AuthKey, peer: &CertIdentity) -> Result<()> {
        match peer.identity_in(&self.config.trust_domain) {
            Some(id) if id == key.remote_identity => Ok(()),
            Some(id) => Err(Error::Authentication(format!(
                "{key}: peer presented identity {id}, expected {}",
                key.remote_identity
            ))),
            None => Err(Error::Authentication(format!(
                "{key}: peer certificate {} carries no identity in trust domain {}",
                peer.display_name, self.config.trust_domain
            ))),
        }
    }
}

#[async_trait]
impl AuthHandler for MutualAuthHandler {
    fn auth_type(&self) -> AuthType {
        AuthType::MutualTls
    }

    #[tracing::instrument(skip_all, fields(key = %key))]
    async fn authenticate(&self, key: &AuthKey) -> Result<DateTime<Utc>> {
        let local = self
            .certificates
            .certificate_for_identity(key.local_identity)
            .await?;
        let leaf = local.leaf().ok_or_else(|| {
            Error::Certificate(format!(
                "empty certificate chain for identity {}",
                key.local_identity
            ))
        })?;
        let local_cert = CertIdentity::from_der(leaf)?;

        let now = Utc::now();
        if local_cert.not_after <= now {
            return Err(Error::Certificate(format!(
                "local certificate for identity {} expired at {}",
                key.local_identity, local_cert.not_after
            )));
        }

        let server_name = server_name_for_identity(&self.config.trust_domain, key.remote_identity);
        let peer_der = tokio::time::timeout(
            self.config.connect_timeout,
            self.handshake.handshake(&local, key.remote_node_id, &server_name),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "handshake with node {} for {server_name} exceeded {:?}",
                key.remote_node_id, self.config.connect_timeout
            ))
        })??;

        let peer = CertIdentity::from_der(&peer_der)?;
        self.verify_peer(key, &peer)?;

        let expiration = local_cert.not_after.min(peer.not_after);
        if expiration <= now {
            return Err(Error::Certificate(format!(
                "{key}: peer certificate {} expired at {}",
                peer.display_name, peer.not_after
            )));
        }

        debug!(peer = %peer.display_name, expiration = %expiration, "Mutual TLS handshake succeeded");
        Ok(expiration)
    }

    fn subscribe_to_rotated_identities(
        &self,
    ) -> Option<broadcast::Receiver<CertificateRotationEvent>> {
        Some(self.certificates.subscribe_to_rotated_identities())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use rcgen::string::Ia5String;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

    fn workload_cert(trust_domain: &str, identity: u32, not_after: (i32, u8, u8)) -> Vec<u8> {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("workload-{identity}"));
        params.distinguished_name = dn;
        params.subject_alt_names = vec![SanType::URI(
            Ia5String::try_from(format!("spiffe://{trust_domain}/identity/{identity}").as_str())
                .unwrap(),
        )];
        params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
        let key_pair = KeyPair::generate().unwrap();
        params.self_signed(&key_pair).unwrap().der().to_vec()
    }

    struct StaticCertificates {
        certs: HashMap<Identity, Vec<u8>>,
        rotations: broadcast::Sender<CertificateRotationEvent>,
    }

    impl StaticCertificates {
        fn new(certs: impl IntoIterator<Item = (u32, Vec<u8>)>) -> Self {
            let (rotations, _) = broadcast::channel(8);
            Self {
                certs: certs.into_iter().map(|(id, der)| (Identity(id), der)).collect(),
                rotations,
            }
        }
    }

    #[async_trait]
    impl CertificateProvider for StaticCertificates {
        async fn certificate_for_identity(
            &self,
            identity: Identity,
        ) -> Result<IdentityCertificate> {
            self.certs
                .get(&identity)
                .map(|der| IdentityCertificate {
                    chain: vec![der.clone()],
                    private_key: Vec::new(),
                })
                .ok_or_else(|| Error::Certificate(format!("no certificate for {identity}")))
        }

        fn subscribe_to_rotated_identities(
            &self,
        ) -> broadcast::Receiver<CertificateRotationEvent> {
            self.rotations.subscribe()
        }
    }

    /// Returns a fixed peer certificate and records the requested server name.
    struct FixedPeer {
        peer: Vec<u8>,
        delay: Duration,
        seen: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PeerHandshake for FixedPeer {
        async fn handshake(
            &self,
            _local: &IdentityCertificate,
            _remote_node: NodeId,
            server_name: &str,
        ) -> Result<Vec<u8>> {
            self.seen.lock().push(server_name.to_string());
            tokio::time::sleep(self.delay).await;
            Ok(self.peer.clone())
        }
    }

    fn handler(local: Vec<u8>, peer: Vec<u8>, delay: Duration) -> (MutualAuthHandler, Arc<FixedPeer>) {
        let certificates = Arc::new(StaticCertificates::new([(10, local)]));
        let handshake = Arc::new(FixedPeer {
            peer,
            delay,
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let config = MutualAuthConfig {
            connect_timeout: Duration::from_millis(200),
            ..MutualAuthConfig::default()
        };
        (
            MutualAuthHandler::new(config, certificates, handshake.clone()),
            handshake,
        )
    }

    fn key() -> AuthKey {
        AuthKey::new(10, 20, NodeId(1))
    }

    #[tokio::test]
    async fn expiration_is_earliest_of_both_certificates() {
        // GIVEN: local cert valid until 2045, peer cert valid until 2040
        let (handler, peer) = handler(
            workload_cert("spiffe.cilium", 10, (2045, 1, 1)),
            workload_cert("spiffe.cilium", 20, (2040, 6, 1)),
            Duration::ZERO,
        );
        // WHEN: authenticating 10 -> 20
        let expiration = handler.authenticate(&key()).await.unwrap();
        // THEN: the earlier expiry wins and SNI names the remote identity
        assert_eq!(expiration.to_rfc3339(), "2040-06-01T00:00:00+00:00");
        assert_eq!(peer.seen.lock().as_slice(), ["20.spiffe.cilium"]);
    }

    #[tokio::test]
    async fn peer_with_wrong_identity_is_rejected() {
        let (handler, _) = handler(
            workload_cert("spiffe.cilium", 10, (2045, 1, 1)),
            workload_cert("spiffe.cilium", 99, (2045, 1, 1)),
            Duration::ZERO,
        );
        let err = handler.authenticate(&key()).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
        assert!(err.to_string().contains("expected 20"));
    }

    #[tokio::test]
    async fn peer_from_foreign_trust_domain_is_rejected() {
        let (handler, _) = handler(
            workload_cert("spiffe.cilium", 10, (2045, 1, 1)),
            workload_cert("evil.example", 20, (2045, 1, 1)),
            Duration::ZERO,
        );
        assert!(matches!(
            handler.authenticate(&key()).await,
            Err(Error::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn expired_local_certificate_fails() {
        let (handler, peer) = handler(
            workload_cert("spiffe.cilium", 10, (2001, 1, 1)),
            workload_cert("spiffe.cilium", 20, (2045, 1, 1)),
            Duration::ZERO,
        );
        assert!(matches!(
            handler.authenticate(&key()).await,
            Err(Error::Certificate(_))
        ));
        // no handshake attempted
        assert!(peer.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_local_certificate_fails() {
        let (handler, _) = handler(
            workload_cert("spiffe.cilium", 10, (2045, 1, 1)),
            workload_cert("spiffe.cilium", 20, (2045, 1, 1)),
            Duration::ZERO,
        );
        let other = AuthKey::new(11, 20, NodeId(1));
        assert!(matches!(
            handler.authenticate(&other).await,
            Err(Error::Certificate(_))
        ));
    }

    #[tokio::test]
    async fn slow_handshake_times_out() {
        let (handler, _) = handler(
            workload_cert("spiffe.cilium", 10, (2045, 1, 1)),
            workload_cert("spiffe.cilium", 20, (2045, 1, 1)),
            Duration::from_secs(5),
        );
        assert!(matches!(
            handler.authenticate(&key()).await,
            Err(Error::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn rotation_events_come_from_the_provider() {
        let certificates = Arc::new(StaticCertificates::new([]));
        let handler = MutualAuthHandler::new(
            MutualAuthConfig::default(),
            certificates.clone(),
            Arc::new(FixedPeer {
                peer: Vec::new(),
                delay: Duration::ZERO,
                seen: parking_lot::Mutex::new(Vec::new()),
            }),
        );
        let mut rx = handler.subscribe_to_rotated_identities().unwrap();
        let event = CertificateRotationEvent {
            identity: Identity(10),
            deleted: false,
        };
        certificates.rotations.send(event).unwrap();
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}
