use crate::models::UserIdentity;
use crate::runtime::RuntimeError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("no sandbox registered for user {0}; create it before connecting")]
    SandboxLookupFailed(UserIdentity),
    #[error("failed to create sandbox for user {user}: {source}")]
    SandboxCreateFailed {
        user: UserIdentity,
        #[source]
        source: RuntimeError,
    },
    #[error("failed to start sandbox for user {user}: {source}")]
    SandboxStartFailed {
        user: UserIdentity,
        #[source]
        source: RuntimeError,
    },
    #[error("user {user} already has {capacity} shells attached")]
    SessionCapacityExceeded { user: UserIdentity, capacity: usize },
    #[error("failed to create shell in sandbox for user {user}: {source}")]
    ExecContextCreateFailed {
        user: UserIdentity,
        #[source]
        source: RuntimeError,
    },
    #[error("failed to attach to shell for user {user}: {source}")]
    ExecAttachFailed {
        user: UserIdentity,
        #[source]
        source: RuntimeError,
    },
    #[error("session stream failed: {0}")]
    StreamCopyFailed(#[source] std::io::Error),
    #[error("failed to stop sandbox for user {user}: {source}")]
    SandboxStopFailed {
        user: UserIdentity,
        #[source]
        source: RuntimeError,
    },
    #[error("session cancelled")]
    SessionCancelled,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl SandboxError {
    /// Short machine-readable name of the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::SandboxLookupFailed(_) => "sandbox_lookup_failed",
            SandboxError::SandboxCreateFailed { .. } => "sandbox_create_failed",
            SandboxError::SandboxStartFailed { .. } => "sandbox_start_failed",
            SandboxError::SessionCapacityExceeded { .. } => "session_capacity_exceeded",
            SandboxError::ExecContextCreateFailed { .. } => "exec_context_create_failed",
            SandboxError::ExecAttachFailed { .. } => "exec_attach_failed",
            SandboxError::StreamCopyFailed(_) => "stream_copy_failed",
            SandboxError::SandboxStopFailed { .. } => "sandbox_stop_failed",
            SandboxError::SessionCancelled => "session_cancelled",
            SandboxError::InvalidRequest(_) => "bad_request",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            SandboxError::SandboxLookupFailed(_) => StatusCode::NOT_FOUND,
            SandboxError::SessionCapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            SandboxError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SandboxError::SandboxCreateFailed { .. }
            | SandboxError::SandboxStartFailed { .. }
            | SandboxError::ExecContextCreateFailed { .. }
            | SandboxError::ExecAttachFailed { .. }
            | SandboxError::SandboxStopFailed { .. } => StatusCode::BAD_GATEWAY,
            SandboxError::StreamCopyFailed(_) | SandboxError::SessionCancelled => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
