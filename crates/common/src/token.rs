// Opaque token identifiers for credentials, sessions and workspaces.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::{Uuid, Version};

const HYPHENATED_LEN: usize = 36;

/// A version-4 UUID string used as an opaque token.
///
/// Only the format is checked; the structure is never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Token(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token must be a hyphenated UUID string")]
    Malformed,

    #[error("token must be a version 4 UUID")]
    WrongVersion,
}

impl Token {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn parse(value: &str) -> Result<Self, TokenError> {
        if value.len() != HYPHENATED_LEN {
            return Err(TokenError::Malformed);
        }
        let uuid = Uuid::parse_str(value).map_err(|_| TokenError::Malformed)?;
        if uuid.get_version() != Some(Version::Random) {
            return Err(TokenError::WrongVersion);
        }
        Ok(Self(value.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Token {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Token {
    type Error = TokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.0
    }
}
