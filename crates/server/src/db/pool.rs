use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

const DEFAULT_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Sizing for the Postgres pools behind the token cache and durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| env::var(key))
    }

    /// Unset or unparsable variables keep their default. A zero maximum is
    /// raised to one and the minimum never exceeds the maximum.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let read = |key: &str| env(key).ok().and_then(|value| value.trim().parse::<u64>().ok());
        let defaults = Self::default();

        let max_connections = read("CTXSYNC_DB_MAX_CONNECTIONS")
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(defaults.max_connections)
            .max(1);
        let min_connections = read("CTXSYNC_DB_MIN_CONNECTIONS")
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(defaults.min_connections)
            .min(max_connections);
        let acquire_timeout = read("CTXSYNC_DB_ACQUIRE_TIMEOUT_SECS")
            .map_or(defaults.acquire_timeout, Duration::from_secs);

        Self { min_connections, max_connections, acquire_timeout }
    }
}

pub async fn create_pg_pool(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let connect_options =
        database_url.parse::<PgConnectOptions>().context("invalid ctxsync database URL")?;
    ensure_postgres_tls(&connect_options)?;

    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .with_context(|| {
            format!(
                "could not open ctxsync database pool (max {} connections)",
                config.max_connections
            )
        })
}

/// Round-trips a trivial query to prove the pool can serve requests.
pub async fn check_pool_health(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("ctxsync database did not answer a liveness query")?;

    Ok(())
}

fn ensure_postgres_tls(options: &PgConnectOptions) -> Result<()> {
    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!(
            "ctxsync database URLs need sslmode=require, verify-ca or verify-full; found {mode:?}"
        ),
    }
}
