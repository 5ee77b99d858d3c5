// Durable persistence: the source of truth that survives cache eviction.
//
// Consulted only on cache misses (hydration) and on eviction flushes.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use ctxsync_common::{
    token::Token,
    types::{ChangeLog, FileBuffers},
};
use serde::{Deserialize, Serialize};
use sqlx::{types::Json, PgPool};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::EngineError;

const STORE_NAME: &str = "durable store";

/// Files and change history of a workspace as last flushed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
    pub files: FileBuffers,
    pub change_log: ChangeLog,
}

/// Creation record of a client session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub credential_token: Token,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct WorkspaceRow {
    files: Json<FileBuffers>,
    change_log: Json<ChangeLog>,
}

#[derive(Debug, sqlx::FromRow)]
struct ClientSessionRow {
    credential_token: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum DurableStore {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryDurable>>),
}

#[derive(Debug, Default)]
pub struct MemoryDurable {
    workspaces: HashMap<Token, WorkspaceSnapshot>,
    sessions: HashMap<Token, SessionRow>,
    #[cfg(test)]
    workspace_flushes: usize,
}

impl DurableStore {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryDurable::default())))
    }

    pub async fn get_workspace(
        &self,
        workspace: &Token,
    ) -> Result<Option<WorkspaceSnapshot>, EngineError> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, WorkspaceRow>(
                    r#"
                    SELECT files, change_log
                    FROM workspace_contexts
                    WHERE workspace_token = $1
                    "#,
                )
                .bind(workspace.as_str())
                .fetch_optional(pool)
                .await
                .map_err(unavailable)?;

                Ok(row.map(|row| WorkspaceSnapshot {
                    files: row.files.0,
                    change_log: row.change_log.0,
                }))
            }
            Self::Memory(state) => Ok(state.read().await.workspaces.get(workspace).cloned()),
        }
    }

    pub async fn upsert_workspace(
        &self,
        workspace: &Token,
        files: &FileBuffers,
        change_log: &ChangeLog,
    ) -> Result<(), EngineError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO workspace_contexts (workspace_token, files, change_log, updated_at)
                    VALUES ($1, $2, $3, now())
                    ON CONFLICT (workspace_token) DO UPDATE
                    SET files = EXCLUDED.files,
                        change_log = EXCLUDED.change_log,
                        updated_at = now()
                    "#,
                )
                .bind(workspace.as_str())
                .bind(Json(files))
                .bind(Json(change_log))
                .execute(pool)
                .await
                .map_err(unavailable)?;
                Ok(())
            }
            Self::Memory(state) => {
                let mut guard = state.write().await;
                guard.workspaces.insert(
                    workspace.clone(),
                    WorkspaceSnapshot { files: files.clone(), change_log: change_log.clone() },
                );
                #[cfg(test)]
                {
                    guard.workspace_flushes += 1;
                }
                Ok(())
            }
        }
    }

    pub async fn record_session_start(
        &self,
        session: &Token,
        credential: &Token,
        started_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO client_sessions (session_token, credential_token, started_at)
                    VALUES ($1, $2, $3)
                    "#,
                )
                .bind(session.as_str())
                .bind(credential.as_str())
                .bind(started_at)
                .execute(pool)
                .await
                .map_err(unavailable)?;
                Ok(())
            }
            Self::Memory(state) => {
                state.write().await.sessions.insert(
                    session.clone(),
                    SessionRow {
                        credential_token: credential.clone(),
                        started_at,
                        ended_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    pub async fn record_session_end(
        &self,
        session: &Token,
        ended_at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let updated = match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    r#"
                    UPDATE client_sessions
                    SET ended_at = $2
                    WHERE session_token = $1
                    "#,
                )
                .bind(session.as_str())
                .bind(ended_at)
                .execute(pool)
                .await
                .map_err(unavailable)?
                .rows_affected()
                    > 0
            }
            Self::Memory(state) => match state.write().await.sessions.get_mut(session) {
                Some(row) => {
                    row.ended_at = Some(ended_at);
                    true
                }
                None => false,
            },
        };

        if !updated {
            warn!(session = %session, "no creation record to stamp the session end on");
        }
        Ok(())
    }

    pub async fn session_record(&self, session: &Token) -> Result<Option<SessionRow>, EngineError> {
        match self {
            Self::Postgres(pool) => {
                let row = sqlx::query_as::<_, ClientSessionRow>(
                    r#"
                    SELECT credential_token, started_at, ended_at
                    FROM client_sessions
                    WHERE session_token = $1
                    "#,
                )
                .bind(session.as_str())
                .fetch_optional(pool)
                .await
                .map_err(unavailable)?;

                row.map(|row| {
                    let credential_token = Token::parse(&row.credential_token).map_err(|err| {
                        EngineError::validation(format!("session {session} credential"), err)
                    })?;
                    Ok(SessionRow {
                        credential_token,
                        started_at: row.started_at,
                        ended_at: row.ended_at,
                    })
                })
                .transpose()
            }
            Self::Memory(state) => Ok(state.read().await.sessions.get(session).cloned()),
        }
    }

    /// Sessions of `credential` that have a creation record but no end stamp.
    pub async fn open_sessions_for_credential(
        &self,
        credential: &Token,
    ) -> Result<Vec<Token>, EngineError> {
        match self {
            Self::Postgres(pool) => {
                let rows = sqlx::query_scalar::<_, String>(
                    r#"
                    SELECT session_token
                    FROM client_sessions
                    WHERE credential_token = $1
                      AND ended_at IS NULL
                    ORDER BY started_at ASC
                    "#,
                )
                .bind(credential.as_str())
                .fetch_all(pool)
                .await
                .map_err(unavailable)?;

                let mut sessions = Vec::with_capacity(rows.len());
                for raw in rows {
                    match Token::parse(&raw) {
                        Ok(token) => sessions.push(token),
                        Err(err) => {
                            warn!(session = %raw, error = %err, "skipping malformed session row")
                        }
                    }
                }
                Ok(sessions)
            }
            Self::Memory(state) => {
                let guard = state.read().await;
                let mut open = guard
                    .sessions
                    .iter()
                    .filter(|(_, row)| {
                        row.credential_token == *credential && row.ended_at.is_none()
                    })
                    .map(|(token, row)| (row.started_at, token.clone()))
                    .collect::<Vec<_>>();
                open.sort();
                Ok(open.into_iter().map(|(_, token)| token).collect())
            }
        }
    }

    /// Number of workspace flushes the in-memory store has received.
    #[cfg(test)]
    pub(crate) async fn workspace_flush_count(&self) -> usize {
        match self {
            Self::Postgres(_) => unreachable!("flushes are only counted in memory"),
            Self::Memory(state) => state.read().await.workspace_flushes,
        }
    }
}

fn unavailable(source: sqlx::Error) -> EngineError {
    EngineError::StoreUnavailable { store: STORE_NAME, source }
}
