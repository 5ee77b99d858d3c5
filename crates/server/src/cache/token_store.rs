use std::sync::Arc;

use ctxsync_common::token::Token;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::{CacheBackend, Expiry, PolicyTable, TokenKind, TokenPolicy};
use crate::error::EngineError;

/// Typed access to the token cache with per-kind expiry rules applied.
#[derive(Debug, Clone)]
pub struct TokenStore {
    backend: CacheBackend,
    policies: Arc<PolicyTable>,
}

impl TokenStore {
    pub fn new(backend: CacheBackend, policies: PolicyTable) -> Self {
        Self { backend, policies: Arc::new(policies) }
    }

    pub fn in_memory() -> Self {
        Self::new(CacheBackend::memory(), PolicyTable::default())
    }

    pub fn backend(&self) -> &CacheBackend {
        &self.backend
    }

    pub fn policy(&self, kind: TokenKind) -> &TokenPolicy {
        self.policies.policy(kind)
    }

    /// Reads a token's value, restarting its window when the policy refreshes on read.
    pub async fn get<T: DeserializeOwned>(
        &self,
        kind: TokenKind,
        token: &Token,
    ) -> Result<Option<T>, EngineError> {
        let key = kind.cache_key(token.as_str());
        let policy = self.policy(kind);
        let raw = match policy.ttl {
            Some(ttl) if policy.refresh_on_read => self.backend.get_and_touch(&key, ttl).await?,
            _ => self.backend.get(&key).await?,
        };
        debug!(%kind, hit = raw.is_some(), "token cache read");
        decode(key, raw)
    }

    /// Reads a token's value without touching its expiry.
    pub async fn peek<T: DeserializeOwned>(
        &self,
        kind: TokenKind,
        token: &Token,
    ) -> Result<Option<T>, EngineError> {
        let key = kind.cache_key(token.as_str());
        let raw = self.backend.get(&key).await?;
        decode(key, raw)
    }

    pub async fn contains(&self, kind: TokenKind, token: &Token) -> Result<bool, EngineError> {
        let key = kind.cache_key(token.as_str());
        Ok(self.backend.get(&key).await?.is_some())
    }

    /// Writes a token's value.
    ///
    /// The expiry window restarts only when the kind's policy refreshes on
    /// write or `force_reset_expiry` is set; otherwise a live entry keeps its
    /// remaining lifetime.
    pub async fn set<T: Serialize>(
        &self,
        kind: TokenKind,
        token: &Token,
        value: &T,
        force_reset_expiry: bool,
    ) -> Result<(), EngineError> {
        let key = kind.cache_key(token.as_str());
        let encoded = serde_json::to_value(value)
            .map_err(|source| EngineError::CorruptEntry { key: key.clone(), source })?;
        let policy = self.policy(kind);
        let expiry = match policy.ttl {
            None => Expiry::Never,
            Some(ttl) if force_reset_expiry || policy.refresh_on_write => Expiry::After(ttl),
            Some(ttl) => Expiry::KeepOr(ttl),
        };
        debug!(%kind, ?expiry, "token cache write");
        self.backend.set(&key, encoded, expiry).await
    }

    /// Every live entry of `kind`, without touching expiry. Keys that do not
    /// hold a well-formed token are skipped.
    pub async fn scan<T: DeserializeOwned>(
        &self,
        kind: TokenKind,
    ) -> Result<Vec<(Token, T)>, EngineError> {
        let prefix = kind.cache_key("");
        let mut entries = Vec::new();
        for (key, raw) in self.backend.live_entries(&prefix).await? {
            let Ok(token) = Token::parse(&key[prefix.len()..]) else {
                warn!(%kind, key = %key, "skipping cache entry with malformed token");
                continue;
            };
            if let Some(value) = decode(key, Some(raw))? {
                entries.push((token, value));
            }
        }
        debug!(%kind, entries = entries.len(), "token cache scan");
        Ok(entries)
    }

    /// Removes a single entry without any cascade; returns whether it was live.
    pub async fn evict(&self, kind: TokenKind, token: &Token) -> Result<bool, EngineError> {
        let key = kind.cache_key(token.as_str());
        let removed = self.backend.delete(&key).await?;
        debug!(%kind, removed, "token cache evict");
        Ok(removed)
    }
}

fn decode<T: DeserializeOwned>(
    key: String,
    raw: Option<serde_json::Value>,
) -> Result<Option<T>, EngineError> {
    raw.map(|value| {
        serde_json::from_value(value).map_err(|source| EngineError::CorruptEntry { key, source })
    })
    .transpose()
}
