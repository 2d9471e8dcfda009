//! Process configuration, read from environment variables.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use conduit_stream::LeaseConfig;

use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    Constraint(String),
}

/// Which queue/ledger/DLQ implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Redis,
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Backend::Redis),
            "memory" | "in-memory" | "inmemory" => Ok(Backend::Memory),
            other => Err(format!("unknown backend '{other}', expected redis or memory")),
        }
    }
}

/// Conduit configuration.
#[derive(Debug, Clone)]
pub struct ConduitConfig {
    pub backend: Backend,
    /// Redis connection URL
    pub redis_url: String,
    /// Inbound stream key
    pub stream: String,
    /// Consumer group name
    pub group: String,
    /// Consumer name (unique per process)
    pub consumer: String,
    /// Default destination for replies
    pub outbound_stream: String,
    pub dlq_key: String,
    pub ledger_prefix: String,
    pub max_retries: u32,
    pub backoff_schedule: Vec<Duration>,
    /// Lease idle time after which a pending event is reclaimed
    pub idle_timeout: Duration,
    pub reclaim_interval: Duration,
    /// XREADGROUP block timeout
    pub block_timeout: Duration,
    pub ledger_ttl: Duration,
    pub workers: usize,
    pub pipeline_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Sleep for the scheduled backoff before releasing a failed event
    pub sleep_on_retry: bool,
    pub history_limit: usize,
    pub admin_addr: SocketAddr,
    /// Bearer token for the operator API; `None` makes the binary fall back to a dev token
    pub admin_token: Option<String>,
    pub model_url: String,
    /// Postgres URL for conversation history; in-memory history when unset
    pub database_url: Option<String>,
}

impl ConduitConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str, default: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let config = Self {
            backend: parse("CONDUIT_BACKEND", &var("CONDUIT_BACKEND", "redis"))?,
            redis_url: var("REDIS_URL", "redis://127.0.0.1:6379"),
            stream: var("CONDUIT_STREAM", "conduit:inbound"),
            group: var("CONDUIT_GROUP", "conduit"),
            consumer: lookup("CONDUIT_CONSUMER")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| format!("consumer-{}", uuid::Uuid::now_v7())),
            outbound_stream: var("CONDUIT_OUTBOUND_STREAM", "conduit:outbound"),
            dlq_key: var("CONDUIT_DLQ_KEY", "conduit:dlq"),
            ledger_prefix: var("CONDUIT_LEDGER_PREFIX", "conduit:retries"),
            max_retries: parse("CONDUIT_MAX_RETRIES", &var("CONDUIT_MAX_RETRIES", "3"))?,
            backoff_schedule: parse_schedule(&var("CONDUIT_BACKOFF_MS", "1000,2000,4000"))?,
            idle_timeout: millis("CONDUIT_IDLE_TIMEOUT_MS", &var("CONDUIT_IDLE_TIMEOUT_MS", "60000"))?,
            reclaim_interval: millis(
                "CONDUIT_RECLAIM_INTERVAL_MS",
                &var("CONDUIT_RECLAIM_INTERVAL_MS", "5000"),
            )?,
            block_timeout: millis("CONDUIT_BLOCK_MS", &var("CONDUIT_BLOCK_MS", "2000"))?,
            ledger_ttl: Duration::from_secs(parse(
                "CONDUIT_LEDGER_TTL_SECS",
                &var("CONDUIT_LEDGER_TTL_SECS", "86400"),
            )?),
            workers: parse("CONDUIT_WORKERS", &var("CONDUIT_WORKERS", "1"))?,
            pipeline_timeout: millis(
                "CONDUIT_PIPELINE_TIMEOUT_MS",
                &var("CONDUIT_PIPELINE_TIMEOUT_MS", "30000"),
            )?,
            shutdown_grace: millis(
                "CONDUIT_SHUTDOWN_GRACE_MS",
                &var("CONDUIT_SHUTDOWN_GRACE_MS", "10000"),
            )?,
            sleep_on_retry: parse_bool("CONDUIT_SLEEP_ON_RETRY", &var("CONDUIT_SLEEP_ON_RETRY", "false"))?,
            history_limit: parse("CONDUIT_HISTORY_LIMIT", &var("CONDUIT_HISTORY_LIMIT", "20"))?,
            admin_addr: parse("CONDUIT_ADMIN_ADDR", &var("CONDUIT_ADMIN_ADDR", "0.0.0.0:8080"))?,
            admin_token: lookup("ADMIN_TOKEN").filter(|v| !v.trim().is_empty()),
            model_url: var("MODEL_URL", "http://127.0.0.1:8000/generate"),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries < 1 {
            return Err(ConfigError::Constraint(
                "CONDUIT_MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        if self.workers < 1 {
            return Err(ConfigError::Constraint(
                "CONDUIT_WORKERS must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Constraint(
                "CONDUIT_IDLE_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }
        if self.reclaim_interval.is_zero() {
            return Err(ConfigError::Constraint(
                "CONDUIT_RECLAIM_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }
        if self.idle_timeout < self.pipeline_timeout {
            tracing::warn!(
                idle_timeout_ms = self.idle_timeout.as_millis() as u64,
                pipeline_timeout_ms = self.pipeline_timeout.as_millis() as u64,
                "lease idle timeout is shorter than the pipeline timeout; slow runs will be reclaimed and processed twice"
            );
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.backoff_schedule.clone())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            pipeline_timeout: self.pipeline_timeout,
            sleep_on_retry: self.sleep_on_retry,
            shutdown_grace: self.shutdown_grace,
        }
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            idle_timeout: self.idle_timeout,
            reclaim_interval: self.reclaim_interval,
            ..LeaseConfig::default()
        }
    }
}

fn parse<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn millis(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse::<u64>(var, value).map(Duration::from_millis)
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_schedule(value: &str) -> Result<Vec<Duration>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| millis("CONDUIT_BACKOFF_MS", s))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ConduitConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ConduitConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();

        assert_eq!(config.backend, Backend::Redis);
        assert_eq!(config.max_retries, 3);
        assert_eq!(
            config.backoff_schedule,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.reclaim_interval, Duration::from_secs(5));
        assert_eq!(config.block_timeout, Duration::from_secs(2));
        assert_eq!(config.ledger_ttl, Duration::from_secs(86_400));
        assert_eq!(config.workers, 1);
        assert!(!config.sleep_on_retry);
        assert_eq!(config.history_limit, 20);
        assert_eq!(config.admin_addr.port(), 8080);
        assert!(config.consumer.starts_with("consumer-"));
        assert!(config.admin_token.is_none());
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides() {
        let config = config(&[
            ("CONDUIT_BACKEND", "memory"),
            ("CONDUIT_CONSUMER", "worker-7"),
            ("CONDUIT_MAX_RETRIES", "5"),
            ("CONDUIT_BACKOFF_MS", "100, 250"),
            ("CONDUIT_SLEEP_ON_RETRY", "yes"),
            ("CONDUIT_WORKERS", "4"),
            ("ADMIN_TOKEN", "secret"),
        ])
        .unwrap();

        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.consumer, "worker-7");
        assert_eq!(config.retry_policy().max_retries, 5);
        assert_eq!(
            config.retry_policy().backoff_schedule,
            vec![Duration::from_millis(100), Duration::from_millis(250)]
        );
        assert!(config.sleep_on_retry);
        assert_eq!(config.workers, 4);
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            config(&[("CONDUIT_MAX_RETRIES", "lots")]),
            Err(ConfigError::Invalid { var: "CONDUIT_MAX_RETRIES", .. })
        ));
        assert!(matches!(
            config(&[("CONDUIT_MAX_RETRIES", "0")]),
            Err(ConfigError::Constraint(_))
        ));
        assert!(matches!(
            config(&[("CONDUIT_WORKERS", "0")]),
            Err(ConfigError::Constraint(_))
        ));
        assert!(matches!(
            config(&[("CONDUIT_RECLAIM_INTERVAL_MS", "0")]),
            Err(ConfigError::Constraint(_))
        ));
        assert!(matches!(
            config(&[("CONDUIT_IDLE_TIMEOUT_MS", "0")]),
            Err(ConfigError::Constraint(_))
        ));
        assert!(config(&[("CONDUIT_BACKEND", "kafka")]).is_err());
        assert!(config(&[("CONDUIT_BACKOFF_MS", "1000,soon")]).is_err());
    }
}
