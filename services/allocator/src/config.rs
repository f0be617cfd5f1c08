use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::dispatcher::DispatcherConfig;
use crate::scheduler::SchedulerConfig;
use crate::store::DbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub dispatcher: DispatcherConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let log_level = lookup("BMFLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("BMFLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let non_empty = |key: &str| lookup(key).filter(|s| !s.trim().is_empty());
        let conductor = non_empty("BMFLEET_CONDUCTOR_ID")
            .or_else(|| non_empty("HOSTNAME"))
            .unwrap_or_else(|| format!("conductor-{}", uuid::Uuid::new_v4()));

        let defaults = DbConfig::default();
        let database = DbConfig {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| defaults.database_url.clone()),
            max_connections: parse_var(&lookup, "DB_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: parse_var(&lookup, "DB_MIN_CONNECTIONS", defaults.min_connections)?,
            ..defaults
        };

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            node_locked_retry_attempts: parse_var(
                &lookup,
                "BMFLEET_NODE_LOCKED_RETRY_ATTEMPTS",
                scheduler_defaults.node_locked_retry_attempts,
            )?,
            node_locked_retry_interval: Duration::from_millis(parse_var(
                &lookup,
                "BMFLEET_NODE_LOCKED_RETRY_INTERVAL_MS",
                scheduler_defaults.node_locked_retry_interval.as_millis() as u64,
            )?),
        };

        let mut dispatcher = DispatcherConfig::new(conductor);
        dispatcher.workers = parse_var(&lookup, "BMFLEET_ALLOCATION_WORKERS", dispatcher.workers)?;
        dispatcher.queue_capacity = parse_var(
            &lookup,
            "BMFLEET_ALLOCATION_QUEUE_CAPACITY",
            dispatcher.queue_capacity,
        )?;
        dispatcher.scheduler = scheduler;

        if dispatcher.workers == 0 {
            anyhow::bail!("BMFLEET_ALLOCATION_WORKERS must be at least 1");
        }

        Ok(Self {
            log_level,
            dev_mode,
            database,
            dispatcher,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}
