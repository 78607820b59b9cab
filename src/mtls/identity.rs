//! Certificate identity extraction.
//!
//! Parses an X.509 DER-encoded certificate and extracts the fields the mutual
//! TLS handler needs: SPIFFE IDs from the URI SANs, the Common Name for logs,
//! and the end of the validity window.
//!
//! Workload identities are encoded as `spiffe://<trust-domain>/identity/<id>`.

use std::fmt;

use chrono::{DateTime, Utc};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use crate::types::Identity;
use crate::{Error, Result};

const SPIFFE_SCHEME: &str = "spiffe://";
const IDENTITY_PATH_PREFIX: &str = "/identity/";

// ─────────────────────────────────────────────────────────────────────────────
// SPIFFE ID
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed `spiffe://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiffeId {
    trust_domain: String,
    path: String,
}

impl SpiffeId {
    /// The SPIFFE ID a workload identity is issued under.
    #[must_use]
    pub fn for_identity(trust_domain: &str, identity: Identity) -> Self {
        Self {
            trust_domain: trust_domain.to_string(),
            path: format!("{IDENTITY_PATH_PREFIX}{identity}"),
        }
    }

    /// Parse a `spiffe://trust-domain/path` URI.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the scheme is not `spiffe` or the trust
    /// domain is empty.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix(SPIFFE_SCHEME)
            .ok_or_else(|| Error::Certificate(format!("not a SPIFFE ID: {uri}")))?;
        let (trust_domain, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };
        if trust_domain.is_empty() {
            return Err(Error::Certificate(format!(
                "SPIFFE ID without trust domain: {uri}"
            )));
        }
        Ok(Self {
            trust_domain: trust_domain.to_string(),
            path: path.to_string(),
        })
    }

    /// Trust domain component.
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Workload identity encoded in the path, if this is an identity SPIFFE ID.
    #[must_use]
    pub fn identity(&self) -> Option<Identity> {
        let id = self.path.strip_prefix(IDENTITY_PATH_PREFIX)?;
        // Canonical decimal only: no sign, no leading zeros
        let canonical = !id.is_empty()
            && id.bytes().all(|b| b.is_ascii_digit())
            && (id == "0" || !id.starts_with('0'));
        if !canonical {
            return None;
        }
        id.parse::<u32>().ok().map(Identity)
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SPIFFE_SCHEME}{}{}", self.trust_domain, self.path)
    }
}

/// TLS server name used to request the certificate of `identity`.
#[must_use]
pub fn server_name_for_identity(trust_domain: &str, identity: Identity) -> String {
    format!("{identity}.{trust_domain}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity fields extracted from a workload certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertIdentity {
    /// SPIFFE IDs found in the URI SANs.
    pub spiffe_ids: Vec<SpiffeId>,

    /// Certificate Common Name (CN).
    pub common_name: Option<String>,

    /// End of the certificate's validity window.
    pub not_after: DateTime<Utc>,

    /// Pre-computed human-readable label for logs.
    pub display_name: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the certificate cannot be parsed or its
    /// validity window is out of range.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {e}")))?;

        let common_name = extract_cn(&cert);
        let spiffe_ids = extract_spiffe_ids(&cert);
        let not_after = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .ok_or_else(|| Error::Certificate("certificate not_after out of range".into()))?;
        let display_name = build_display_name(common_name.as_ref(), &spiffe_ids);

        Ok(Self {
            spiffe_ids,
            common_name,
            not_after,
            display_name,
        })
    }

    /// The workload identity this certificate asserts within `trust_domain`.
    #[must_use]
    pub fn identity_in(&self, trust_domain: &str) -> Option<Identity> {
        self.spiffe_ids
            .iter()
            .filter(|id| id.trust_domain() == trust_domain)
            .find_map(SpiffeId::identity)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Extract the CN attribute from the subject DN.
fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

/// Extract every parseable SPIFFE URI SAN.
fn extract_spiffe_ids(cert: &X509Certificate<'_>) -> Vec<SpiffeId> {
    let mut ids = Vec::new();

    if let Ok(Some(san_ext)) = cert.subject_alternative_name() {
        for name in &san_ext.value.general_names {
            if let GeneralName::URI(uri) = name
                && let Ok(id) = SpiffeId::parse(uri)
            {
                ids.push(id);
            }
        }
    }

    ids
}

/// Prefers the first SPIFFE ID, then CN, then `"<unknown>"`.
fn build_display_name(cn: Option<&String>, spiffe_ids: &[SpiffeId]) -> String {
    spiffe_ids
        .first()
        .map(ToString::to_string)
        .or_else(|| cn.cloned())
        .unwrap_or_else(|| "<unknown>".to_owned())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
