//! Endpoint configuration.
//!
//! Everything has a default except the storage backend, which must be named
//! explicitly: silently falling back to non-durable memory storage would lose
//! batches on restart.
//!
//! Environment variables (all optional unless stated):
//!
//! | variable                                   | meaning                               |
//! |--------------------------------------------|---------------------------------------|
//! | `WEBHOOK_ENDPOINT_LISTEN_ADDR`             | socket address, default `0.0.0.0:3000`|
//! | `WEBHOOK_ENDPOINT_INGEST_MODE`             | `permissive` (default) or `strict`    |
//! | `WEBHOOK_ENDPOINT_MAX_BODY_BYTES`          | request body limit                    |
//! | `WEBHOOK_ENDPOINT_PING_BUFFER`             | pings queued for the consumer         |
//! | `WEBHOOK_ENDPOINT_DELIVERY`                | `bounded` (default) or `pull`         |
//! | `WEBHOOK_ENDPOINT_MAX_ATTEMPTS`            | dispatches per batch when bounded     |
//! | `WEBHOOK_ENDPOINT_REDELIVERY_DELAY_MS`     | wait after a failure when pull        |
//! | `WEBHOOK_ENDPOINT_DEMAND_WINDOW`           | batches buffered ahead of the consumer|
//! | `WEBHOOK_ENDPOINT_POLL_INTERVAL_SECS`      | empty-storage re-check interval       |
//! | `WEBHOOK_ENDPOINT_SHUTDOWN_GRACE_SECS`     | wait for outstanding batches          |
//! | `WEBHOOK_ENDPOINT_STORAGE` (required)      | `memory` or `spool`                   |
//! | `WEBHOOK_ENDPOINT_SPOOL_DIR`               | spool directory, required for `spool` |
//!
//! `MAX_ATTEMPTS` and `REDELIVERY_DELAY_MS` each belong to one delivery mode;
//! setting the other mode's variable is an error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::delivery::{DEFAULT_MAX_ATTEMPTS, DEFAULT_REDELIVERY_DELAY, DeliveryStrategy, PumpConfig};

const PREFIX: &str = "WEBHOOK_ENDPOINT_";

/// Default request body limit (10 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Default capacity of the ping notification channel.
pub const DEFAULT_PING_BUFFER: usize = 64;

/// Errors reading or validating configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(String),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

/// How the ingestion endpoint treats valid JSON that is not an array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IngestMode {
    /// Accept it as a ping: 200, nothing stored.
    #[default]
    Permissive,
    /// Reject it with 400.
    Strict,
}

impl FromStr for IngestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "permissive" => Ok(IngestMode::Permissive),
            "strict" => Ok(IngestMode::Strict),
            _ => Err("expected `permissive` or `strict`".to_string()),
        }
    }
}

/// Which storage provider the binary should open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Spool(PathBuf),
}

impl StorageBackend {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = format!("{PREFIX}STORAGE");
        let kind = lookup(&var).ok_or_else(|| ConfigError::Missing(var.clone()))?;

        match kind.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "spool" => {
                let dir_var = format!("{PREFIX}SPOOL_DIR");
                let dir = lookup(&dir_var)
                    .filter(|d| !d.is_empty())
                    .ok_or(ConfigError::Missing(dir_var))?;
                Ok(StorageBackend::Spool(PathBuf::from(dir)))
            }
            _ => Err(ConfigError::Invalid {
                var,
                value: kind,
                reason: "expected `memory` or `spool`".to_string(),
            }),
        }
    }
}

/// Runtime settings for a [`WebhookEndpoint`](crate::endpoint::WebhookEndpoint).
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub listen_addr: SocketAddr,
    pub ingest_mode: IngestMode,
    pub max_body_bytes: usize,
    pub ping_buffer: usize,
    pub pump: PumpConfig,
    pub strategy: DeliveryStrategy,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            ingest_mode: IngestMode::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            ping_buffer: DEFAULT_PING_BUFFER,
            pump: PumpConfig::default(),
            strategy: DeliveryStrategy::default(),
        }
    }
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `WEBHOOK_ENDPOINT_*` variables over the defaults.
    ///
    /// Unlike unset variables, which fall back to defaults, variables that are
    /// set but unparseable are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let get = |name: &str| {
            let var = format!("{PREFIX}{name}");
            lookup(&var).map(|value| (var, value))
        };

        let listen_addr = parsed(get("LISTEN_ADDR"))?.unwrap_or(defaults.listen_addr);
        let ingest_mode = parsed(get("INGEST_MODE"))?.unwrap_or(defaults.ingest_mode);
        let max_body_bytes = parsed(get("MAX_BODY_BYTES"))?.unwrap_or(defaults.max_body_bytes);
        let ping_buffer = parsed(get("PING_BUFFER"))?.unwrap_or(defaults.ping_buffer);

        let pump = PumpConfig {
            demand_window: parsed(get("DEMAND_WINDOW"))?.unwrap_or(defaults.pump.demand_window),
            poll_interval: parsed(get("POLL_INTERVAL_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(defaults.pump.poll_interval),
            shutdown_grace: parsed(get("SHUTDOWN_GRACE_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(defaults.pump.shutdown_grace),
            ..defaults.pump
        };

        let strategy = match get("DELIVERY") {
            Some((_, value)) if value.eq_ignore_ascii_case("pull") => {
                not_applicable(get("MAX_ATTEMPTS"), "pull")?;
                DeliveryStrategy::PullRedeliver {
                    redelivery_delay: parsed(get("REDELIVERY_DELAY_MS"))?
                        .map(Duration::from_millis)
                        .unwrap_or(DEFAULT_REDELIVERY_DELAY),
                }
            }
            Some((var, value)) if !value.eq_ignore_ascii_case("bounded") => {
                return Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: "expected `bounded` or `pull`".to_string(),
                });
            }
            _ => {
                not_applicable(get("REDELIVERY_DELAY_MS"), "bounded")?;
                DeliveryStrategy::BoundedPushRetry {
                    max_attempts: parsed(get("MAX_ATTEMPTS"))?.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                }
            }
        };

        let config = EndpointConfig {
            listen_addr,
            ingest_mode,
            max_body_bytes,
            ping_buffer,
            pump,
            strategy,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_ingest_mode(mut self, mode: IngestMode) -> Self {
        self.ingest_mode = mode;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn with_ping_buffer(mut self, capacity: usize) -> Self {
        self.ping_buffer = capacity;
        self
    }

    pub fn with_pump(mut self, pump: PumpConfig) -> Self {
        self.pump = pump;
        self
    }

    pub fn with_strategy(mut self, strategy: DeliveryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Rejects settings that would make the pipeline unable to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |var: &str, value: String, reason: &str| ConfigError::Invalid {
            var: format!("{PREFIX}{var}"),
            value,
            reason: reason.to_string(),
        };

        if self.pump.demand_window == 0 {
            return Err(invalid("DEMAND_WINDOW", "0".to_string(), "must be at least 1"));
        }
        if self.ping_buffer == 0 {
            return Err(invalid("PING_BUFFER", "0".to_string(), "must be at least 1"));
        }
        if self.max_body_bytes == 0 {
            return Err(invalid("MAX_BODY_BYTES", "0".to_string(), "must be at least 1"));
        }
        if let DeliveryStrategy::BoundedPushRetry { max_attempts: 0 } = self.strategy {
            return Err(invalid("MAX_ATTEMPTS", "0".to_string(), "must be at least 1"));
        }
        Ok(())
    }
}

/// Fails if a variable meant for another delivery mode is set.
fn not_applicable(entry: Option<(String, String)>, delivery: &str) -> Result<(), ConfigError> {
    match entry {
        Some((var, value)) => Err(ConfigError::Invalid {
            var,
            value,
            reason: format!("not used with `{delivery}` delivery"),
        }),
        None => Ok(()),
    }
}

/// Parses an optional `(variable, value)` pair.
fn parsed<T>(entry: Option<(String, String)>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    entry
        .map(|(var, value)| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                reason: e.to_string(),
                var,
                value,
            })
        })
        .transpose()
}
