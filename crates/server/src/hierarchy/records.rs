use std::collections::BTreeSet;

use ctxsync_common::{
    token::Token,
    types::{ChangeLog, FileBuffers},
};
use serde::{Deserialize, Serialize};

use crate::persistence::WorkspaceSnapshot;

/// Cache value for an authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub user_id: String,
    #[serde(default)]
    pub session_token: Option<Token>,
}

/// Cache value for one client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub credential_token: Token,
    #[serde(default)]
    pub workspace_tokens: BTreeSet<Token>,
}

/// Cache value for one open workspace, including its buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    #[serde(default)]
    pub session_tokens: BTreeSet<Token>,
    #[serde(default)]
    pub files: FileBuffers,
    #[serde(default)]
    pub change_log: ChangeLog,
}

impl SessionRecord {
    pub fn new(credential_token: Token) -> Self {
        Self { credential_token, workspace_tokens: BTreeSet::new() }
    }
}

impl From<WorkspaceSnapshot> for WorkspaceRecord {
    fn from(snapshot: WorkspaceSnapshot) -> Self {
        Self {
            session_tokens: BTreeSet::new(),
            files: snapshot.files,
            change_log: snapshot.change_log,
        }
    }
}
