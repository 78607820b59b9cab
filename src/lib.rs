//! Mesh Authentication Library
//!
//! Per-flow mutual authentication for policy-enforced service meshes. The
//! datapath drops packets of unauthenticated flows and signals; this crate
//! authenticates the identity pair out of band and records the decision in
//! the shared auth table the datapath consults.
//!
//! # Components
//!
//! - **Auth handlers**: one strategy per auth type (null, always-fail, mutual TLS)
//! - **Auth map cache**: write-through mirror of the shared table, restored on start
//! - **Auth manager**: turns signals and certificate rotations into handler calls
//! - **Garbage collector**: drops entries of deleted identities and nodes, and expired ones
//! - **Jobs**: concurrent observers and timers with bounded queues and graceful shutdown
//!
//! [`cell::MeshAuth::start`] wires everything together.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod authmap;
pub mod cache;
pub mod cell;
pub mod config;
pub mod error;
pub mod gc;
pub mod handler;
pub mod jobs;
pub mod manager;
pub mod metrics;
pub mod mtls;
pub mod policy;
pub mod signal;
pub mod types;

pub use cell::{MeshAuth, MeshAuthParams};
pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

/// Install a global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. `format: json` selects
/// structured output.
///
/// # Errors
///
/// Returns `Error::Config` if a global subscriber is already installed.
pub fn setup_tracing(log: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match log.format.as_deref() {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
