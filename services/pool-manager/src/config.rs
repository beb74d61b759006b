use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use respool_retry::RetryPolicy;

use crate::allocation::StaticCityResolver;
use crate::db::DbConfig;
use crate::lock::LockConfig;
use crate::pipeline::{PipelineConfig, ReaperConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Run migrations on startup.
    pub dev_mode: bool,
    pub database: DbConfig,
    pub redis_url: String,
    pub lock: LockConfig,
    pub pipeline: PipelineConfig,
    pub reaper: ReaperConfig,
    pub cities: StaticCityResolver,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = parse_or(&lookup, "RESPOOL_LISTEN_ADDR", "127.0.0.1:8080".parse::<SocketAddr>()?)?;

        let log_level = lookup("RESPOOL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("RESPOOL_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let db_defaults = DbConfig::default();
        let database = DbConfig {
            database_url: lookup("DATABASE_URL").unwrap_or(db_defaults.database_url),
            max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", db_defaults.max_connections)?,
            min_connections: parse_or(&lookup, "DB_MIN_CONNECTIONS", db_defaults.min_connections)?,
            acquire_timeout: Duration::from_secs(parse_or(
                &lookup,
                "DB_ACQUIRE_TIMEOUT_SECS",
                db_defaults.acquire_timeout.as_secs(),
            )?),
        };
        if database.max_connections == 0 || database.min_connections > database.max_connections {
            anyhow::bail!("DB_MAX_CONNECTIONS must be positive and at least DB_MIN_CONNECTIONS");
        }

        let redis_url = lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1/".to_string());

        let lock = LockConfig {
            ttl: Duration::from_secs(parse_or(&lookup, "RESPOOL_LOCK_TTL_SECS", 30u64)?),
            max_attempts: parse_or(&lookup, "RESPOOL_LOCK_MAX_ATTEMPTS", 30u32)?,
            retry_delay: Duration::from_millis(parse_or(&lookup, "RESPOOL_LOCK_RETRY_DELAY_MS", 100u64)?),
            retry_jitter: Duration::from_millis(parse_or(&lookup, "RESPOOL_LOCK_RETRY_JITTER_MS", 50u64)?),
        };
        if lock.max_attempts == 0 {
            anyhow::bail!("RESPOOL_LOCK_MAX_ATTEMPTS must be at least 1");
        }

        let pipeline = PipelineConfig {
            capacity: parse_or(&lookup, "RESPOOL_PIPELINE_CAPACITY", 1024usize)?,
            batch_size: parse_or(&lookup, "RESPOOL_PIPELINE_BATCH_SIZE", 64usize)?,
            retry: RetryPolicy::default(),
        };
        if pipeline.capacity == 0 || pipeline.batch_size == 0 {
            anyhow::bail!("pipeline capacity and batch size must be positive");
        }

        let reaper = ReaperConfig {
            interval: Duration::from_secs(parse_or(&lookup, "RESPOOL_REAPER_INTERVAL_SECS", 60u64)?.max(1)),
            reservation_ttl: Duration::from_secs(parse_or(&lookup, "RESPOOL_PRESELECT_TTL_SECS", 1800u64)?),
        };

        let cities = StaticCityResolver::from_json(&lookup("RESPOOL_CITY_MAP").unwrap_or_default())
            .context("RESPOOL_CITY_MAP must be a JSON object of string arrays")?;

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            redis_url,
            lock,
            pipeline,
            reaper,
            cities,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: '{raw}'")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.lock, LockConfig::default());
        assert_eq!(config.pipeline.capacity, 1024);
        assert_eq!(config.reaper.reservation_ttl, Duration::from_secs(1800));
        assert!(!config.dev_mode);
        assert!(config.cities.is_empty());
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("RESPOOL_LOCK_MAX_ATTEMPTS", "5"),
            ("RESPOOL_LOCK_RETRY_DELAY_MS", "20"),
            ("RESPOOL_DEV", "TRUE"),
            ("RESPOOL_CITY_MAP", r#"{"south": ["shenzhen"]}"#),
        ])
        .unwrap();
        assert_eq!(config.lock.max_attempts, 5);
        assert_eq!(config.lock.retry_delay, Duration::from_millis(20));
        assert!(config.dev_mode);
        assert_eq!(config.cities.len(), 1);
    }

    #[test]
    fn test_invalid_values_fail() {
        assert!(config(&[("RESPOOL_LOCK_TTL_SECS", "soon")]).is_err());
        assert!(config(&[("RESPOOL_LOCK_MAX_ATTEMPTS", "0")]).is_err());
        assert!(config(&[("RESPOOL_CITY_MAP", "not json")]).is_err());
        assert!(config(&[("RESPOOL_LISTEN_ADDR", "nowhere")]).is_err());
    }

    #[test]
    fn test_database_settings_come_from_lookup() {
        let config = config(&[
            ("DATABASE_URL", "postgres://db/injected"),
            ("DB_MAX_CONNECTIONS", "25"),
            ("DB_ACQUIRE_TIMEOUT_SECS", "2"),
        ])
        .unwrap();
        assert_eq!(config.database.database_url, "postgres://db/injected");
        assert_eq!(config.database.max_connections, 25);
        assert_eq!(config.database.min_connections, 1);
        assert_eq!(config.database.acquire_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_invalid_database_settings_fail() {
        assert!(config(&[("DB_MAX_CONNECTIONS", "lots")]).is_err());
        assert!(config(&[("DB_MIN_CONNECTIONS", "-1")]).is_err());
        assert!(config(&[("DB_MAX_CONNECTIONS", "0")]).is_err());
        assert!(config(&[("DB_MAX_CONNECTIONS", "2"), ("DB_MIN_CONNECTIONS", "5")]).is_err());
    }
}
