//! Mutual TLS handler configuration.
//!
//! # Example YAML
//!
//! ```yaml
//! mutual:
//!   trust_domain: "spiffe.cilium"
//!   connect_timeout: "5s"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::humantime_serde;

/// Configuration for the SPIFFE-backed mutual TLS handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MutualAuthConfig {
    /// SPIFFE trust domain that workload identities are issued under.
    pub trust_domain: String,

    /// Upper bound on a single handshake with a remote node.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for MutualAuthConfig {
    fn default() -> Self {
        Self {
            trust_domain: "spiffe.cilium".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}
