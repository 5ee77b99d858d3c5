use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use ctxsync_common::{redact::RedactionError, token::Token};
use serde_json::json;
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::cache::TokenKind;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

/// Failures surfaced by the token hierarchy and the context store.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed for {subject}: {reason}")]
    Validation { subject: String, reason: String },

    #[error("{kind} token {token} not found")]
    NotFound { kind: TokenKind, token: Token },

    #[error("{store} is unavailable")]
    StoreUnavailable {
        store: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("session {session} is bound to a different credential")]
    CredentialMismatch { session: Token },

    #[error("workspace {workspace} is still linked to {sessions} session(s)")]
    WorkspaceInUse { workspace: Token, sessions: usize },

    #[error("redaction failed for `{file}`")]
    Redaction {
        file: String,
        #[source]
        source: RedactionError,
    },

    #[error("cache entry `{key}` could not be decoded")]
    CorruptEntry {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    pub fn not_found(kind: TokenKind, token: &Token) -> Self {
        Self::NotFound { kind, token: token.clone() }
    }

    pub fn validation(subject: impl Into<String>, reason: impl ToString) -> Self {
        Self::Validation { subject: subject.into(), reason: reason.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    Forbidden,
    NotFound,
    Conflict,
    StoreUnavailable,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::StoreUnavailable => "STORE_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict => StatusCode::CONFLICT,
            Self::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub const fn retryable(self) -> bool {
        matches!(self, Self::StoreUnavailable | Self::InternalError)
    }
}

/// Error body returned by the HTTP surface.
#[derive(Debug, Clone)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let code = match &err {
            EngineError::Validation { .. } | EngineError::Redaction { .. } => {
                ErrorCode::ValidationFailed
            }
            EngineError::NotFound { .. } => ErrorCode::NotFound,
            EngineError::CredentialMismatch { .. } | EngineError::WorkspaceInUse { .. } => {
                ErrorCode::Conflict
            }
            EngineError::StoreUnavailable { .. } => ErrorCode::StoreUnavailable,
            EngineError::CorruptEntry { .. } => ErrorCode::InternalError,
        };
        if code.retryable() {
            error!(error = %err, source = ?std::error::Error::source(&err), "engine call failed");
        }
        Self::new(code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();

        let mut response = (
            self.code.status(),
            Json(json!({
                "error": {
                    "code": self.code.as_str(),
                    "message": self.message,
                    "retryable": self.code.retryable(),
                    "request_id": request_id.clone(),
                }
            })),
        )
            .into_response();

        if let Some(request_id) = request_id {
            attach_request_id_header(&mut response, &request_id);
        }

        response
    }
}

pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
