use chrono::Utc;
use ctxsync_common::token::Token;
use tracing::{debug, info, warn};

use super::links;
use super::records::{CredentialRecord, SessionRecord, WorkspaceRecord};
use crate::cache::{TokenKind, TokenStore};
use crate::context::WorkspaceLocks;
use crate::error::EngineError;
use crate::persistence::DurableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Absent,
    Active,
}

/// Where an activated workspace's buffers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceOrigin {
    Cache,
    Durable,
    New,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceActivation {
    pub origin: WorkspaceOrigin,
    pub session_count: usize,
    pub file_count: usize,
}

/// Orchestrates activation and cascading deletion across the three token
/// kinds.
///
/// Every delete is idempotent. Cascades span several cache keys and are not
/// atomic. A dangling reference left by an interrupted cascade or by session
/// expiry is dropped the next time the workspace is activated or detached,
/// and [`SessionHierarchyManager::sweep_orphaned_workspaces`] flushes
/// workspaces nobody touches again. Each workspace entry is rewritten only
/// under its lock.
#[derive(Debug, Clone)]
pub struct SessionHierarchyManager {
    tokens: TokenStore,
    durable: DurableStore,
    locks: WorkspaceLocks,
}

impl SessionHierarchyManager {
    pub fn new(tokens: TokenStore, durable: DurableStore) -> Self {
        Self { tokens, durable, locks: WorkspaceLocks::new() }
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn durable(&self) -> &DurableStore {
        &self.durable
    }

    /// Per-workspace locks guarding every rewrite of a workspace entry.
    /// Callers of [`crate::context::WorkspaceContextStore::apply_update`]
    /// must hold the same lock.
    pub fn locks(&self) -> &WorkspaceLocks {
        &self.locks
    }

    pub async fn state(&self, kind: TokenKind, token: &Token) -> Result<TokenState, EngineError> {
        Ok(if self.tokens.contains(kind, token).await? {
            TokenState::Active
        } else {
            TokenState::Absent
        })
    }

    pub async fn activate_credential(
        &self,
        credential: &Token,
        user_id: &str,
    ) -> Result<CredentialRecord, EngineError> {
        if let Some(existing) =
            self.tokens.get::<CredentialRecord>(TokenKind::Credential, credential).await?
        {
            return Ok(existing);
        }

        let record = CredentialRecord { user_id: user_id.to_owned(), session_token: None };
        self.tokens.set(TokenKind::Credential, credential, &record, false).await?;
        info!(credential = %credential, user_id, "credential activated");
        Ok(record)
    }

    /// Restarts a credential's expiry window.
    pub async fn refresh_credential(&self, credential: &Token) -> Result<(), EngineError> {
        let record = self
            .tokens
            .get::<CredentialRecord>(TokenKind::Credential, credential)
            .await?
            .ok_or_else(|| EngineError::not_found(TokenKind::Credential, credential))?;
        self.tokens.set(TokenKind::Credential, credential, &record, true).await?;
        debug!(credential = %credential, "credential expiry reset");
        Ok(())
    }

    /// Creates a new session for `credential`: durable creation record first,
    /// then activation.
    pub async fn start_session(&self, credential: &Token) -> Result<Token, EngineError> {
        if !self.tokens.contains(TokenKind::Credential, credential).await? {
            return Err(EngineError::not_found(TokenKind::Credential, credential));
        }

        let session = Token::generate();
        self.durable.record_session_start(&session, credential, Utc::now()).await?;
        self.activate_session(&session, credential).await?;
        Ok(session)
    }

    pub async fn activate_session(
        &self,
        session: &Token,
        credential: &Token,
    ) -> Result<SessionRecord, EngineError> {
        let mut credential_record = self
            .tokens
            .get::<CredentialRecord>(TokenKind::Credential, credential)
            .await?
            .ok_or_else(|| EngineError::not_found(TokenKind::Credential, credential))?;

        let record = match self.tokens.get::<SessionRecord>(TokenKind::Session, session).await? {
            Some(record) if record.credential_token != *credential => {
                return Err(EngineError::CredentialMismatch { session: session.clone() });
            }
            Some(record) => record,
            None => self.hydrate_session(session, Some(credential)).await?,
        };
        self.tokens.set(TokenKind::Session, session, &record, false).await?;

        if credential_record.session_token.as_ref() != Some(session) {
            credential_record.session_token = Some(session.clone());
            self.tokens.set(TokenKind::Credential, credential, &credential_record, false).await?;
        }

        info!(session = %session, credential = %credential, "session activated");
        Ok(record)
    }

    pub async fn activate_workspace(
        &self,
        workspace: &Token,
        session: &Token,
    ) -> Result<WorkspaceActivation, EngineError> {
        let mut session_record = self.load_session(session).await?;

        let _guard = self.locks.acquire(workspace).await;
        let (mut workspace_record, origin) =
            match self.tokens.get::<WorkspaceRecord>(TokenKind::Workspace, workspace).await? {
                Some(record) => (record, WorkspaceOrigin::Cache),
                None => match self.durable.get_workspace(workspace).await? {
                    Some(snapshot) => (WorkspaceRecord::from(snapshot), WorkspaceOrigin::Durable),
                    None => (WorkspaceRecord::default(), WorkspaceOrigin::New),
                },
            };

        self.prune_dangling_sessions(workspace, &mut workspace_record, Some(session)).await?;
        self.prune_dangling_workspaces(session, &mut session_record, workspace).await?;

        links::link(session, &mut session_record, workspace, &mut workspace_record);
        self.tokens.set(TokenKind::Workspace, workspace, &workspace_record, false).await?;
        self.tokens.set(TokenKind::Session, session, &session_record, false).await?;

        let activation = WorkspaceActivation {
            origin,
            session_count: workspace_record.session_tokens.len(),
            file_count: workspace_record.files.len(),
        };
        info!(
            workspace = %workspace,
            session = %session,
            origin = ?activation.origin,
            sessions = activation.session_count,
            files = activation.file_count,
            "workspace activated"
        );
        Ok(activation)
    }

    /// Whether `session` is active and linked to the active `workspace`.
    ///
    /// Counts as an access to the session, so its window is refreshed.
    pub async fn session_has_workspace(
        &self,
        session: &Token,
        workspace: &Token,
    ) -> Result<bool, EngineError> {
        let session_record = self.load_session(session).await?;
        if !session_record.workspace_tokens.contains(workspace) {
            return Ok(false);
        }
        Ok(self
            .tokens
            .peek::<WorkspaceRecord>(TokenKind::Workspace, workspace)
            .await?
            .is_some_and(|record| links::is_linked(session, &session_record, workspace, &record)))
    }

    pub async fn delete_token(&self, kind: TokenKind, token: &Token) -> Result<(), EngineError> {
        match kind {
            TokenKind::Credential => self.delete_credential(token).await,
            TokenKind::Session => self.delete_session(token).await,
            TokenKind::Workspace => self.delete_workspace(token).await,
        }
    }

    /// Removes the credential and every session still open under it.
    pub async fn delete_credential(&self, credential: &Token) -> Result<(), EngineError> {
        let Some(record) =
            self.tokens.peek::<CredentialRecord>(TokenKind::Credential, credential).await?
        else {
            debug!(credential = %credential, "credential already absent");
            return Ok(());
        };

        self.tokens.evict(TokenKind::Credential, credential).await?;
        info!(credential = %credential, "credential deleted");

        let mut sessions = self.durable.open_sessions_for_credential(credential).await?;
        if let Some(linked) = record.session_token {
            if !sessions.contains(&linked) {
                sessions.push(linked);
            }
        }
        for session in &sessions {
            let cached = self.tokens.peek::<SessionRecord>(TokenKind::Session, session).await?;
            let record = match cached {
                Some(record) => record,
                None => self.recover_session_links(session, credential).await?,
            };
            self.end_session(session, record).await?;
        }
        Ok(())
    }

    pub async fn delete_session(&self, session: &Token) -> Result<(), EngineError> {
        let Some(record) = self.tokens.peek::<SessionRecord>(TokenKind::Session, session).await?
        else {
            debug!(session = %session, "session already absent");
            return Ok(());
        };
        self.end_session(session, record).await
    }

    /// Flushes and evicts a workspace that no session references any more.
    pub async fn delete_workspace(&self, workspace: &Token) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(workspace).await;
        let Some(mut record) =
            self.tokens.peek::<WorkspaceRecord>(TokenKind::Workspace, workspace).await?
        else {
            debug!(workspace = %workspace, "workspace already absent");
            return Ok(());
        };

        if !record.session_tokens.is_empty() {
            self.prune_dangling_sessions(workspace, &mut record, None).await?;
        }
        if !record.session_tokens.is_empty() {
            return Err(EngineError::WorkspaceInUse {
                workspace: workspace.clone(),
                sessions: record.session_tokens.len(),
            });
        }

        self.flush_and_evict(workspace, &record).await
    }

    /// Flushes and evicts every cached workspace whose sessions have all
    /// expired. Returns how many were flushed.
    pub async fn sweep_orphaned_workspaces(&self) -> Result<usize, EngineError> {
        let mut flushed = 0;
        for (workspace, _) in self.tokens.scan::<WorkspaceRecord>(TokenKind::Workspace).await? {
            let _guard = self.locks.acquire(&workspace).await;
            let Some(mut record) =
                self.tokens.peek::<WorkspaceRecord>(TokenKind::Workspace, &workspace).await?
            else {
                continue;
            };

            let linked = record.session_tokens.len();
            self.prune_dangling_sessions(&workspace, &mut record, None).await?;
            if record.session_tokens.is_empty() {
                self.flush_and_evict(&workspace, &record).await?;
                flushed += 1;
            } else if record.session_tokens.len() != linked {
                self.tokens.set(TokenKind::Workspace, &workspace, &record, false).await?;
            }
        }
        Ok(flushed)
    }

    async fn end_session(
        &self,
        session: &Token,
        mut record: SessionRecord,
    ) -> Result<(), EngineError> {
        self.tokens.evict(TokenKind::Session, session).await?;
        self.durable.record_session_end(session, Utc::now()).await?;
        info!(session = %session, workspaces = record.workspace_tokens.len(), "session deleted");

        for workspace in record.workspace_tokens.clone() {
            self.detach_session(&workspace, session, &mut record).await?;
        }

        if let Some(mut credential) = self
            .tokens
            .peek::<CredentialRecord>(TokenKind::Credential, &record.credential_token)
            .await?
        {
            if credential.session_token.as_ref() == Some(session) {
                credential.session_token = None;
                self.tokens
                    .set(TokenKind::Credential, &record.credential_token, &credential, false)
                    .await?;
            }
        }
        Ok(())
    }

    /// Rebuilds the record of a session that expired from the cache out of
    /// the workspaces still listing it.
    async fn recover_session_links(
        &self,
        session: &Token,
        credential: &Token,
    ) -> Result<SessionRecord, EngineError> {
        let mut record = SessionRecord::new(credential.clone());
        for (workspace, peer) in self.tokens.scan::<WorkspaceRecord>(TokenKind::Workspace).await? {
            if peer.session_tokens.contains(session) {
                record.workspace_tokens.insert(workspace);
            }
        }
        debug!(
            session = %session,
            workspaces = record.workspace_tokens.len(),
            "recovered links of expired session"
        );
        Ok(record)
    }

    async fn detach_session(
        &self,
        workspace: &Token,
        session: &Token,
        session_record: &mut SessionRecord,
    ) -> Result<(), EngineError> {
        let _guard = self.locks.acquire(workspace).await;
        let Some(mut workspace_record) =
            self.tokens.peek::<WorkspaceRecord>(TokenKind::Workspace, workspace).await?
        else {
            session_record.workspace_tokens.remove(workspace);
            return Ok(());
        };

        links::unlink(session, session_record, workspace, &mut workspace_record);
        self.prune_dangling_sessions(workspace, &mut workspace_record, None).await?;
        if workspace_record.session_tokens.is_empty() {
            self.flush_and_evict(workspace, &workspace_record).await
        } else {
            self.tokens.set(TokenKind::Workspace, workspace, &workspace_record, false).await
        }
    }

    async fn flush_and_evict(
        &self,
        workspace: &Token,
        record: &WorkspaceRecord,
    ) -> Result<(), EngineError> {
        self.durable.upsert_workspace(workspace, &record.files, &record.change_log).await?;
        self.tokens.evict(TokenKind::Workspace, workspace).await?;
        info!(workspace = %workspace, files = record.files.len(), "workspace flushed and evicted");
        Ok(())
    }

    /// Active session record, hydrating it from its creation record on a miss.
    async fn load_session(&self, session: &Token) -> Result<SessionRecord, EngineError> {
        if let Some(record) = self.tokens.get::<SessionRecord>(TokenKind::Session, session).await?
        {
            return Ok(record);
        }

        let record = self.hydrate_session(session, None).await?;
        if !self.tokens.contains(TokenKind::Credential, &record.credential_token).await? {
            return Err(EngineError::not_found(TokenKind::Credential, &record.credential_token));
        }
        self.tokens.set(TokenKind::Session, session, &record, false).await?;
        Ok(record)
    }

    async fn hydrate_session(
        &self,
        session: &Token,
        expected_credential: Option<&Token>,
    ) -> Result<SessionRecord, EngineError> {
        let row = self
            .durable
            .session_record(session)
            .await?
            .filter(|row| row.ended_at.is_none())
            .ok_or_else(|| EngineError::not_found(TokenKind::Session, session))?;

        if expected_credential.is_some_and(|credential| *credential != row.credential_token) {
            return Err(EngineError::CredentialMismatch { session: session.clone() });
        }

        debug!(session = %session, "session hydrated from durable store");
        Ok(SessionRecord::new(row.credential_token))
    }

    /// Drops workspace→session references whose session is gone or no longer
    /// points back. `keep` is exempt because the caller is about to link it.
    async fn prune_dangling_sessions(
        &self,
        workspace: &Token,
        record: &mut WorkspaceRecord,
        keep: Option<&Token>,
    ) -> Result<(), EngineError> {
        for session in record.session_tokens.clone() {
            if keep == Some(&session) {
                continue;
            }
            let linked_back = self
                .tokens
                .peek::<SessionRecord>(TokenKind::Session, &session)
                .await?
                .is_some_and(|peer| peer.workspace_tokens.contains(workspace));
            if !linked_back {
                record.session_tokens.remove(&session);
                warn!(workspace = %workspace, session = %session, "dropped dangling session link");
            }
        }
        Ok(())
    }

    /// Drops session→workspace references whose workspace is gone or no
    /// longer points back. `keep` is exempt because the caller is about to
    /// link it.
    async fn prune_dangling_workspaces(
        &self,
        session: &Token,
        record: &mut SessionRecord,
        keep: &Token,
    ) -> Result<(), EngineError> {
        for workspace in record.workspace_tokens.clone() {
            if workspace == *keep {
                continue;
            }
            let linked_back = self
                .tokens
                .peek::<WorkspaceRecord>(TokenKind::Workspace, &workspace)
                .await?
                .is_some_and(|peer| peer.session_tokens.contains(session));
            if !linked_back {
                record.workspace_tokens.remove(&workspace);
                warn!(
                    session = %session,
                    workspace = %workspace,
                    "dropped dangling workspace link"
                );
            }
        }
        Ok(())
    }
}
