// HTTP surface over the token hierarchy and the workspace context store.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{delete, get, post},
    Router,
};
use ctxsync_common::{
    token::Token,
    types::{ChangeBatch, FileBuffers},
};
use serde::{Deserialize, Serialize};

use crate::{
    cache::TokenKind,
    context::{UpdateOutcome, WorkspaceContextStore, WorkspaceLocks},
    error::{ApiError, EngineError, ErrorCode},
    hierarchy::{SessionHierarchyManager, WorkspaceOrigin},
};

pub const SESSION_TOKEN_HEADER: &str = "x-session-token";

#[derive(Clone)]
pub struct AppState {
    pub hierarchy: Arc<SessionHierarchyManager>,
    pub context: Arc<WorkspaceContextStore>,
    pub locks: WorkspaceLocks,
}

impl AppState {
    pub fn new(hierarchy: SessionHierarchyManager, context: WorkspaceContextStore) -> Self {
        Self {
            locks: hierarchy.locks().clone(),
            hierarchy: Arc::new(hierarchy),
            context: Arc::new(context),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCreated {
    pub session_token: Token,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkspaceActivated {
    pub workspace_token: Token,
    pub origin: String,
    pub session_count: usize,
    pub file_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ChangesRequest {
    pub files: ChangeBatch,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContextResponse {
    pub files: FileBuffers,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{session}", delete(delete_session))
        .route("/v1/credentials/{credential}", delete(delete_credential))
        .route("/v1/sessions/{session}/workspaces/{workspace}", post(activate_workspace))
        .route("/v1/workspaces/{workspace}/changes", post(apply_changes))
        .route("/v1/workspaces/{workspace}/context", get(workspace_context))
        .with_state(state)
}

async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<SessionCreated>), ApiError> {
    let credential = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token)
        .ok_or_else(|| ApiError::new(ErrorCode::AuthInvalidToken, "missing bearer credential"))
        .and_then(|raw| {
            Token::parse(raw).map_err(|_| {
                ApiError::new(ErrorCode::AuthInvalidToken, "malformed bearer credential")
            })
        })?;

    let session_token = state.hierarchy.start_session(&credential).await.map_err(|err| match err {
        EngineError::NotFound { kind: TokenKind::Credential, .. } => {
            ApiError::new(ErrorCode::AuthInvalidToken, "credential is not active")
        }
        other => other.into(),
    })?;

    Ok((StatusCode::CREATED, Json(SessionCreated { session_token })))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(session): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session = parse_path_token("session", &session)?;
    state.hierarchy.delete_session(&session).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_credential(
    State(state): State<AppState>,
    Path(credential): Path<String>,
) -> Result<StatusCode, ApiError> {
    let credential = parse_path_token("credential", &credential)?;
    state.hierarchy.delete_credential(&credential).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn activate_workspace(
    State(state): State<AppState>,
    Path((session, workspace)): Path<(String, String)>,
) -> Result<Json<WorkspaceActivated>, ApiError> {
    let session = parse_path_token("session", &session)?;
    let workspace = parse_path_token("workspace", &workspace)?;

    let activation = state.hierarchy.activate_workspace(&workspace, &session).await?;
    let origin = match activation.origin {
        WorkspaceOrigin::Cache => "cache",
        WorkspaceOrigin::Durable => "durable",
        WorkspaceOrigin::New => "new",
    };

    Ok(Json(WorkspaceActivated {
        workspace_token: workspace,
        origin: origin.to_owned(),
        session_count: activation.session_count,
        file_count: activation.file_count,
    }))
}

async fn apply_changes(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
    headers: HeaderMap,
    Json(request): Json<ChangesRequest>,
) -> Result<Json<UpdateOutcome>, ApiError> {
    let workspace = parse_path_token("workspace", &workspace)?;
    let _guard = state.locks.acquire(&workspace).await;
    authorize_session(&state, &headers, &workspace).await?;

    let outcome = state.context.apply_update(&workspace, request.files).await?;
    Ok(Json(outcome))
}

async fn workspace_context(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ContextResponse>, ApiError> {
    let workspace = parse_path_token("workspace", &workspace)?;
    authorize_session(&state, &headers, &workspace).await?;

    let files = state.context.workspace_context(&workspace).await?;
    Ok(Json(ContextResponse { files }))
}

/// Requires an active session, named by header, that has `workspace` open.
async fn authorize_session(
    state: &AppState,
    headers: &HeaderMap,
    workspace: &Token,
) -> Result<(), ApiError> {
    let session = headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| Token::parse(raw.trim()).ok())
        .ok_or_else(|| ApiError::new(ErrorCode::AuthInvalidToken, "missing session token"))?;

    let linked =
        state.hierarchy.session_has_workspace(&session, workspace).await.map_err(|err| {
            match err {
                EngineError::NotFound { .. } | EngineError::CredentialMismatch { .. } => {
                    ApiError::new(ErrorCode::AuthInvalidToken, "session is not active")
                }
                other => other.into(),
            }
        })?;

    if linked {
        Ok(())
    } else {
        Err(ApiError::new(ErrorCode::Forbidden, "workspace is not open in this session"))
    }
}

fn parse_path_token(subject: &str, raw: &str) -> Result<Token, ApiError> {
    Token::parse(raw).map_err(|err| ApiError::from(EngineError::validation(subject, err)))
}

fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
