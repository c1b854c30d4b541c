//! Application configuration.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use validator::Validate;

use crate::{AppError, AppResult};

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Database configuration (credential pool).
    pub database: DatabaseConfig,
    /// Redis configuration (queue store and notification channel).
    pub redis: RedisConfig,
    /// Dispatch tunables.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Message transport configuration.
    pub transport: TransportConfig,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// `PostgreSQL` connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys and channels.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Message transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Endpoint of the message gateway that performs the actual send.
    pub endpoint: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_transport_timeout")]
    pub timeout_secs: u64,
}

/// Scheduler tunables.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound on recipients pulled per dispatch cycle.
    #[validate(range(min = 1))]
    pub batch_size: usize,
    /// Expected sender concurrency; a cycle pulls at most three times this.
    #[validate(range(min = 1))]
    pub concurrency_hint: usize,
    /// Upper bound on credentials requested per cycle.
    #[validate(range(min = 1))]
    pub max_account_batch_size: usize,
    /// Sends allowed per credential per day.
    #[validate(range(min = 1))]
    pub daily_cap: i32,
    /// Over-fetch factor applied to credential demand.
    #[validate(range(min = 1.0))]
    pub priority_multiplier: f64,
    /// Share of fetched credentials taken from the high-priority class.
    #[validate(range(min = 0.0, max = 1.0))]
    pub high_ratio: f64,
    /// Share of fetched credentials taken from the standard class.
    #[validate(range(min = 0.0, max = 1.0))]
    pub low_ratio: f64,
    /// Extra attempts granted to a recipient after a retriable failure.
    pub retry_budget: u32,
    /// Attempts allowed for a recipient that keeps hitting network errors.
    #[validate(range(min = 1))]
    pub network_retry_limit: u32,
    /// Consecutive session-invalid outcomes before a credential is retired.
    #[validate(range(min = 1))]
    pub failure_streak_threshold: u32,
    /// Delay before the poll loop retries when the queue is momentarily empty.
    pub idle_delay_ms: u64,
    /// Minimum spacing between two "need more work" signals for one job.
    pub backpressure_interval_ms: u64,
    /// Cap on requested work, as a multiple of the job's declared size.
    #[validate(range(min = 0.0))]
    pub demand_multiplier: f64,
    /// Credential pool used when an owner has no override.
    #[validate(length(min = 1))]
    pub default_pool: String,
    /// Per-owner credential pool overrides.
    pub owner_pools: HashMap<String, String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency_hint: 50,
            max_account_batch_size: 60,
            daily_cap: 40,
            priority_multiplier: 1.5,
            high_ratio: 2.0 / 3.0,
            low_ratio: 1.0 / 3.0,
            retry_budget: 1,
            network_retry_limit: 5,
            failure_streak_threshold: 3,
            idle_delay_ms: 3000,
            backpressure_interval_ms: 10_000,
            demand_multiplier: 1.0,
            default_pool: "default".to_string(),
            owner_pools: HashMap::new(),
        }
    }
}

impl DispatchConfig {
    /// Credential pool for an owner: its override, else the default pool.
    #[must_use]
    pub fn pool_for(&self, owner_id: &str) -> &str {
        self.owner_pools
            .get(owner_id)
            .map_or(self.default_pool.as_str(), String::as_str)
    }

    /// Delay between empty-queue retries.
    #[must_use]
    pub const fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    /// Minimum spacing between backpressure signals.
    #[must_use]
    pub const fn backpressure_interval(&self) -> Duration {
        Duration::from_millis(self.backpressure_interval_ms)
    }
}

const fn default_transport_timeout() -> u64 {
    30
}

const fn default_max_connections() -> u32 {
    20
}

const fn default_min_connections() -> u32 {
    2
}

fn default_redis_prefix() -> String {
    "courier".to_string()
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `config/default.toml`
    /// 2. `config/{environment}.toml` (based on `COURIER_ENV`)
    /// 3. Environment variables with `COURIER__` prefix
    pub fn load() -> AppResult<Self> {
        let env = std::env::var("COURIER_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("COURIER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the dispatch tunables for internal consistency.
    pub fn validate(&self) -> AppResult<()> {
        self.dispatch.validate()?;
        if self.dispatch.high_ratio + self.dispatch.low_ratio > 1.0 + f64::EPSILON {
            return Err(AppError::Config(
                "dispatch.high_ratio + dispatch.low_ratio must not exceed 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config_with(dispatch: DispatchConfig) -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/courier".to_string(),
                max_connections: 5,
                min_connections: 1,
            },
            redis: RedisConfig {
                url: "redis://localhost:6379".to_string(),
                prefix: default_redis_prefix(),
            },
            dispatch,
            transport: TransportConfig {
                endpoint: "http://localhost:8080/send".to_string(),
                timeout_secs: 10,
            },
        }
    }

    #[test]
    fn test_dispatch_defaults_are_valid() {
        let config = config_with(DispatchConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.retry_budget, 1);
        assert_eq!(config.dispatch.network_retry_limit, 5);
        assert_eq!(config.dispatch.failure_streak_threshold, 3);
    }

    #[test]
    fn test_ratio_overflow_is_rejected() {
        let config = config_with(DispatchConfig {
            high_ratio: 0.8,
            low_ratio: 0.5,
            ..DispatchConfig::default()
        });
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let config = config_with(DispatchConfig {
            batch_size: 0,
            ..DispatchConfig::default()
        });
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_pool_for_owner_override() {
        let mut dispatch = DispatchConfig::default();
        dispatch
            .owner_pools
            .insert("owner-a".to_string(), "pool_a".to_string());

        assert_eq!(dispatch.pool_for("owner-a"), "pool_a");
        assert_eq!(dispatch.pool_for("owner-b"), "default");
    }
}
