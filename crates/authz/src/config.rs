//! Configuration loaded from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Authorization core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthzConfig {
    /// PostgreSQL connection URL. Only the binary requires it.
    pub database_url: Option<String>,

    /// Maximum database connections in pool (default: 5).
    pub database_max_connections: u32,

    /// Cache per-customer authorization results (default: true).
    pub result_cache_enabled: bool,

    /// Lifetime of a cached authorization result (default: 30s).
    pub result_cache_ttl: Duration,

    /// Maximum in-process cache entries (default: 10000).
    pub cache_max_capacity: u64,

    /// Permissions deleted per statement by the installer (default: 500).
    pub delete_chunk_size: usize,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 5,
            result_cache_enabled: true,
            result_cache_ttl: Duration::from_secs(30),
            cache_max_capacity: crate::cache::DEFAULT_MAX_CAPACITY,
            delete_chunk_size: 500,
        }
    }
}

impl AuthzConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let database_url = env::var("DATABASE_URL").ok();

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| defaults.database_max_connections.to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let result_cache_enabled = match env::var("AUTHZ_RESULT_CACHE") {
            Ok(v) => parse_flag(&v).context("AUTHZ_RESULT_CACHE must be true or false")?,
            Err(_) => defaults.result_cache_enabled,
        };

        let result_cache_ttl = env::var("AUTHZ_RESULT_CACHE_TTL_SECS")
            .map(|v| v.parse::<u64>().map(Duration::from_secs))
            .unwrap_or(Ok(defaults.result_cache_ttl))
            .context("AUTHZ_RESULT_CACHE_TTL_SECS must be a whole number of seconds")?;

        let cache_max_capacity = env::var("AUTHZ_CACHE_MAX_CAPACITY")
            .unwrap_or_else(|_| defaults.cache_max_capacity.to_string())
            .parse()
            .context("AUTHZ_CACHE_MAX_CAPACITY must be a valid u64")?;

        let delete_chunk_size: usize = env::var("AUTHZ_DELETE_CHUNK_SIZE")
            .unwrap_or_else(|_| defaults.delete_chunk_size.to_string())
            .parse()
            .context("AUTHZ_DELETE_CHUNK_SIZE must be a valid usize")?;

        if delete_chunk_size == 0 {
            anyhow::bail!("AUTHZ_DELETE_CHUNK_SIZE must be greater than zero");
        }

        Ok(Self {
            database_url,
            database_max_connections,
            result_cache_enabled,
            result_cache_ttl,
            cache_max_capacity,
            delete_chunk_size,
        })
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
