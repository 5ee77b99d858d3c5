// Token cache: per-kind expiry policy over a shared expiring key-value store.

mod backend;
mod token_store;

pub use backend::{CacheBackend, Expiry};
pub use token_store::TokenStore;

use std::{fmt, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

const DAY_SECS: u64 = 24 * 60 * 60;
const KIND_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Credential,
    Session,
    Workspace,
}

impl TokenKind {
    pub const ALL: [TokenKind; KIND_COUNT] = [Self::Credential, Self::Session, Self::Workspace];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::Session => "session",
            Self::Workspace => "workspace",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Credential => 0,
            Self::Session => 1,
            Self::Workspace => 2,
        }
    }

    /// Cache key for a token of this kind.
    pub fn cache_key(self, token: &str) -> String {
        format!("{}:{token}", self.as_str())
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expiry rules for one token kind. `ttl: None` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPolicy {
    pub ttl: Option<Duration>,
    pub refresh_on_read: bool,
    pub refresh_on_write: bool,
}

impl TokenPolicy {
    pub const fn never_expires() -> Self {
        Self { ttl: None, refresh_on_read: false, refresh_on_write: false }
    }

    pub const fn fixed_window(ttl: Duration) -> Self {
        Self { ttl: Some(ttl), refresh_on_read: false, refresh_on_write: false }
    }

    pub const fn sliding_window(ttl: Duration) -> Self {
        Self { ttl: Some(ttl), refresh_on_read: true, refresh_on_write: true }
    }
}

/// Declarative `kind -> policy` table consulted by [`TokenStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    entries: [TokenPolicy; KIND_COUNT],
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            entries: [
                TokenPolicy::fixed_window(Duration::from_secs(30 * DAY_SECS)),
                TokenPolicy::sliding_window(Duration::from_secs(60 * 60)),
                TokenPolicy::never_expires(),
            ],
        }
    }
}

impl PolicyTable {
    pub fn policy(&self, kind: TokenKind) -> &TokenPolicy {
        &self.entries[kind.index()]
    }

    pub fn with_policy(mut self, kind: TokenKind, policy: TokenPolicy) -> Self {
        self.entries[kind.index()] = policy;
        self
    }

    /// Overrides the defaults with the kinds present in a TOML policy file.
    ///
    /// ```toml
    /// [session]
    /// ttl_secs = 1800
    /// refresh_on_read = true
    /// refresh_on_write = true
    /// ```
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        let file: PolicyFile = toml::from_str(contents)?;
        let mut table = Self::default();
        for (kind, entry) in [
            (TokenKind::Credential, file.credential),
            (TokenKind::Session, file.session),
            (TokenKind::Workspace, file.workspace),
        ] {
            if let Some(entry) = entry {
                table = table.with_policy(kind, entry.into());
            }
        }
        Ok(table)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read policy file `{}`", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("failed to parse policy file `{}`", path.display()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyFile {
    credential: Option<PolicyEntry>,
    session: Option<PolicyEntry>,
    workspace: Option<PolicyEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyEntry {
    ttl_secs: Option<u64>,
    #[serde(default)]
    refresh_on_read: bool,
    #[serde(default)]
    refresh_on_write: bool,
}

impl From<PolicyEntry> for TokenPolicy {
    fn from(entry: PolicyEntry) -> Self {
        Self {
            ttl: entry.ttl_secs.map(Duration::from_secs),
            refresh_on_read: entry.refresh_on_read,
            refresh_on_write: entry.refresh_on_write,
        }
    }
}
