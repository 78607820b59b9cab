//! Configuration management

use std::{path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::mtls::MutualAuthConfig;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Authentication processing and garbage collection
    pub auth: MeshAuthConfig,
    /// Mutual TLS handler configuration
    pub mutual: MutualAuthConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    pub level: String,
    /// Log format (`text` or `json`)
    pub format: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

/// Authentication processing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshAuthConfig {
    /// Enable authentication processing & garbage collection
    pub enabled: bool,
    /// Capacity of the auth-required signal queue
    pub queue_size: usize,
    /// Interval in which expired auth entries are garbage collected
    #[serde(with = "humantime_serde")]
    pub gc_interval: Duration,
    /// Upper bound on authentications running at the same time
    pub max_concurrent_authentications: usize,
    /// How long to wait for background jobs on shutdown before aborting them
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for MeshAuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_size: 1024,
            gc_interval: Duration::from_secs(5 * 60),
            max_concurrent_authentications: 64,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (MESHAUTH_ prefix, `__` separates sections)
        figment = figment.merge(Env::prefixed("MESHAUTH_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        self.auth.validate()?;
        if self.mutual.trust_domain.trim().is_empty() {
            return Err(Error::Config(
                "mutual.trust_domain must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl MeshAuthConfig {
    /// Reject queue, concurrency, and interval values the jobs cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.queue_size == 0 || self.queue_size > Semaphore::MAX_PERMITS {
            return Err(Error::Config(format!(
                "auth.queue_size must be between 1 and {}, got {}",
                Semaphore::MAX_PERMITS,
                self.queue_size
            )));
        }
        if self.max_concurrent_authentications == 0
            || self.max_concurrent_authentications > Semaphore::MAX_PERMITS
        {
            return Err(Error::Config(format!(
                "auth.max_concurrent_authentications must be between 1 and {}, got {}",
                Semaphore::MAX_PERMITS,
                self.max_concurrent_authentications
            )));
        }
        if self.gc_interval.is_zero() {
            return Err(Error::Config("auth.gc_interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" before "m" and "s"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            // Assume seconds
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
