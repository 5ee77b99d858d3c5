use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use serde_json::Value;
use sqlx::PgPool;
use tokio::{sync::RwLock, time::Instant};

use crate::db::pool::check_pool_health;
use crate::error::EngineError;

const STORE_NAME: &str = "token cache";

/// How a write treats the entry's expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Never,
    /// Start a fresh window.
    After(Duration),
    /// Keep a live entry's remaining window; new or expired entries get this one.
    KeepOr(Duration),
}

/// The external expiring key-value store.
///
/// Postgres is shared by every server instance; the memory variant backs
/// tests and single-node development runs.
#[derive(Debug, Clone)]
pub enum CacheBackend {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<String, MemoryEntry>>>),
}

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

impl CacheBackend {
    /// Wraps a pool after confirming the cache is reachable.
    pub async fn connect(pool: PgPool) -> anyhow::Result<Self> {
        check_pool_health(&pool).await.context("token cache is unreachable")?;
        Ok(Self::Postgres(pool))
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, EngineError> {
        match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, Value>(
                r#"
                SELECT value
                FROM token_cache
                WHERE cache_key = $1
                  AND (expires_at IS NULL OR expires_at > now())
                "#,
            )
            .bind(key)
            .fetch_optional(pool)
            .await
            .map_err(unavailable),
            Self::Memory(entries) => {
                let now = Instant::now();
                Ok(entries
                    .read()
                    .await
                    .get(key)
                    .filter(|entry| entry.is_live(now))
                    .map(|entry| entry.value.clone()))
            }
        }
    }

    /// Reads a live entry and restarts its window in the same round-trip.
    pub async fn get_and_touch(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Value>, EngineError> {
        match self {
            Self::Postgres(pool) => sqlx::query_scalar::<_, Value>(
                r#"
                UPDATE token_cache
                SET expires_at = now() + make_interval(secs => $2)
                WHERE cache_key = $1
                  AND (expires_at IS NULL OR expires_at > now())
                RETURNING value
                "#,
            )
            .bind(key)
            .bind(ttl.as_secs_f64())
            .fetch_optional(pool)
            .await
            .map_err(unavailable),
            Self::Memory(entries) => {
                let now = Instant::now();
                let mut guard = entries.write().await;
                match guard.get_mut(key) {
                    Some(entry) if entry.is_live(now) => {
                        entry.expires_at = Some(now + ttl);
                        Ok(Some(entry.value.clone()))
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value, expiry: Expiry) -> Result<(), EngineError> {
        match self {
            Self::Postgres(pool) => {
                let (window_secs, keep_live_window) = match expiry {
                    Expiry::Never => (None, false),
                    Expiry::After(ttl) => (Some(ttl.as_secs_f64()), false),
                    Expiry::KeepOr(ttl) => (Some(ttl.as_secs_f64()), true),
                };
                sqlx::query(
                    r#"
                    INSERT INTO token_cache (cache_key, value, expires_at)
                    VALUES (
                        $1,
                        $2,
                        CASE WHEN $3::float8 IS NULL THEN NULL
                             ELSE now() + make_interval(secs => $3::float8) END
                    )
                    ON CONFLICT (cache_key) DO UPDATE
                    SET value = EXCLUDED.value,
                        expires_at = CASE
                            WHEN $4::bool
                                 AND (token_cache.expires_at IS NULL
                                      OR token_cache.expires_at > now())
                                THEN token_cache.expires_at
                            ELSE EXCLUDED.expires_at
                        END
                    "#,
                )
                .bind(key)
                .bind(&value)
                .bind(window_secs)
                .bind(keep_live_window)
                .execute(pool)
                .await
                .map_err(unavailable)?;
                Ok(())
            }
            Self::Memory(entries) => {
                let now = Instant::now();
                let mut guard = entries.write().await;
                let expires_at = match expiry {
                    Expiry::Never => None,
                    Expiry::After(ttl) => Some(now + ttl),
                    Expiry::KeepOr(ttl) => match guard.get(key) {
                        Some(existing) if existing.is_live(now) => existing.expires_at,
                        _ => Some(now + ttl),
                    },
                };
                guard.insert(key.to_owned(), MemoryEntry { value, expires_at });
                Ok(())
            }
        }
    }

    /// Removes `key`; returns whether a live entry was removed.
    pub async fn delete(&self, key: &str) -> Result<bool, EngineError> {
        match self {
            Self::Postgres(pool) => {
                let was_live = sqlx::query_scalar::<_, bool>(
                    r#"
                    DELETE FROM token_cache
                    WHERE cache_key = $1
                    RETURNING (expires_at IS NULL OR expires_at > now())
                    "#,
                )
                .bind(key)
                .fetch_optional(pool)
                .await
                .map_err(unavailable)?;
                Ok(was_live.unwrap_or(false))
            }
            Self::Memory(entries) => {
                let now = Instant::now();
                Ok(entries.write().await.remove(key).is_some_and(|entry| entry.is_live(now)))
            }
        }
    }

    /// Every live entry whose key starts with `prefix`, ordered by key.
    pub async fn live_entries(&self, prefix: &str) -> Result<Vec<(String, Value)>, EngineError> {
        match self {
            Self::Postgres(pool) => sqlx::query_as::<_, (String, Value)>(
                r#"
                SELECT cache_key, value
                FROM token_cache
                WHERE starts_with(cache_key, $1)
                  AND (expires_at IS NULL OR expires_at > now())
                ORDER BY cache_key
                "#,
            )
            .bind(prefix)
            .fetch_all(pool)
            .await
            .map_err(unavailable),
            Self::Memory(entries) => {
                let now = Instant::now();
                let mut live = entries
                    .read()
                    .await
                    .iter()
                    .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
                    .map(|(key, entry)| (key.clone(), entry.value.clone()))
                    .collect::<Vec<_>>();
                live.sort_by(|left, right| left.0.cmp(&right.0));
                Ok(live)
            }
        }
    }

    /// Drops expired entries. Call periodically for storage hygiene.
    pub async fn purge_expired(&self) -> Result<u64, EngineError> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query(
                    "DELETE FROM token_cache WHERE expires_at IS NOT NULL AND expires_at <= now()",
                )
                .execute(pool)
                .await
                .map_err(unavailable)?;
                Ok(result.rows_affected())
            }
            Self::Memory(entries) => {
                let now = Instant::now();
                let mut guard = entries.write().await;
                let before = guard.len();
                guard.retain(|_, entry| entry.is_live(now));
                Ok((before - guard.len()) as u64)
            }
        }
    }

    /// Remaining lifetime of a live entry; `Some(None)` means it never expires.
    #[cfg(test)]
    pub(crate) async fn remaining_ttl(&self, key: &str) -> Option<Option<Duration>> {
        match self {
            Self::Memory(entries) => {
                let now = Instant::now();
                let guard = entries.read().await;
                let entry = guard.get(key).filter(|entry| entry.is_live(now))?;
                Some(entry.expires_at.map(|expires_at| expires_at - now))
            }
            Self::Postgres(_) => None,
        }
    }
}

fn unavailable(source: sqlx::Error) -> EngineError {
    EngineError::StoreUnavailable { store: STORE_NAME, source }
}
