//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The storage URI may embed credentials, so it is wrapped in
//! `secrecy::SecretString` to keep it out of logs.

pub mod secrets;

use std::time::Duration;

use crate::engine::SchedulerConfig;
use crate::error::{Error, Result};
use crate::model::TtlPolicy;
use crate::queue::QueueOptions;
use crate::telemetry::TelemetryConfig;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    /// `redis://`, `rediss://`, `postgres://`, `postgresql://` or `memory://`.
    pub queue_uri: SecretString,
    pub namespace: String,
    pub ttl: TtlPolicy,
    pub sweep_interval: Duration,
    pub lease_timeout: Duration,
    pub poll_interval: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading from `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let queue_uri = lookup("QUEUE_URI").ok_or_else(|| {
            Error::Config("required environment variable QUEUE_URI is not set".to_string())
        })?;

        Ok(Self {
            queue_uri: SecretString::from(queue_uri),
            namespace: lookup("QUEUE_NAMESPACE").unwrap_or_else(|| "qtask".to_string()),
            ttl: match lookup("QUEUE_TTL") {
                Some(entries) => TtlPolicy::parse(&entries)?,
                None => TtlPolicy::default(),
            },
            sweep_interval: Duration::from_secs(parse_positive(&lookup, "QUEUE_SWEEP_INTERVAL", 60)?),
            lease_timeout: Duration::from_secs(parse_positive(&lookup, "LEASE_TIMEOUT", 300)?),
            poll_interval: Duration::from_millis(parse_positive(&lookup, "POLL_INTERVAL_MS", 1000)?),
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            ttl: self.ttl.clone(),
            sweep_interval: self.sweep_interval,
            ..QueueOptions::default()
        }
    }

    /// Scheduler settings with this config's poll interval and lease timeout.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: self.poll_interval,
            lease_timeout: self.lease_timeout,
            ..SchedulerConfig::default()
        }
    }

    pub fn telemetry(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
        }
    }
}

/// Durations here drive sleeps and lease cutoffs, so zero is rejected.
fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
) -> Result<u64> {
    let Some(raw) = lookup(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(Error::Config(format!("{name} must be a positive integer, got '{raw}'"))),
    }
}
