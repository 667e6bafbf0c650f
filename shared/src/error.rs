//! The error taxonomy shared by the control plane and the daemon (C1).
//!
//! `GoConnectError` is the single source of truth for turning a domain
//! failure into an HTTP status (`status_code`) or a gRPC status (`grpc_code`);
//! handlers in `goconnect-control::api` and `goconnect-daemon::ipc` must not
//! hand-roll either. This mirrors `ServerError`/`impl From<&ServerError> for
//! StatusCode` in the teacher's `server/src/error.rs`, extended with the full
//! table from spec §4.1.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// The stable, machine-readable error code clients switch on. One per
/// `GoConnectError` variant (or sub-kind, for `Conflict`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Unauthorized,
    TokenExpired,
    InvalidToken,
    InvalidCredentials,
    Forbidden,
    Banned,
    Kicked,
    NotFound,
    AlreadyMember,
    AlreadyRequested,
    CidrOverlap,
    IpExhausted,
    IdempotencyConflict,
    AlreadyExists,
    InviteExhausted,
    RateLimited,
    NotImplemented,
    Dependency,
    Internal,
}

/// A conflict sub-kind, since several distinct 409s share the `Conflict`
/// variant shape ({kind} carrying the detail).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    CidrOverlap,
    IpExhausted,
    IdempotencyConflict,
    AlreadyExists,
    InviteExhausted,
}

impl ConflictKind {
    fn error_code(self) -> ErrorCode {
        match self {
            Self::CidrOverlap => ErrorCode::CidrOverlap,
            Self::IpExhausted => ErrorCode::IpExhausted,
            Self::IdempotencyConflict => ErrorCode::IdempotencyConflict,
            Self::AlreadyExists => ErrorCode::AlreadyExists,
            Self::InviteExhausted => ErrorCode::InviteExhausted,
        }
    }
}

#[derive(Error, Debug)]
pub enum GoConnectError {
    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid credentials")]
    Unauthorized,

    #[error("credentials have expired")]
    TokenExpired,

    #[error("credentials are malformed or unrecognized")]
    InvalidToken,

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("caller lacks permission for this operation")]
    Forbidden,

    #[error("membership is banned")]
    Banned,

    #[error("membership has been kicked")]
    Kicked,

    #[error("{0} not found")]
    NotFound(String),

    #[error("already a member")]
    AlreadyMember,

    #[error("membership request already pending")]
    AlreadyRequested,

    #[error("{kind:?}: {message}")]
    Conflict { kind: ConflictKind, message: String },

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("not implemented")]
    NotImplemented,

    #[error("dependency failure: {0}")]
    Dependency(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl GoConnectError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(kind: ConflictKind, message: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        use GoConnectError::*;
        match self {
            Validation(_) => ErrorCode::Validation,
            Unauthorized => ErrorCode::Unauthorized,
            TokenExpired => ErrorCode::TokenExpired,
            InvalidToken => ErrorCode::InvalidToken,
            InvalidCredentials => ErrorCode::InvalidCredentials,
            Forbidden => ErrorCode::Forbidden,
            Banned => ErrorCode::Banned,
            Kicked => ErrorCode::Kicked,
            NotFound(_) => ErrorCode::NotFound,
            AlreadyMember => ErrorCode::AlreadyMember,
            AlreadyRequested => ErrorCode::AlreadyRequested,
            Conflict { kind, .. } => kind.error_code(),
            RateLimited => ErrorCode::RateLimited,
            NotImplemented => ErrorCode::NotImplemented,
            Dependency(_) => ErrorCode::Dependency,
            Internal(_) => ErrorCode::Internal,
        }
    }

    /// The fixed status table from spec §4.1. This is the *only* place an
    /// HTTP status is decided; handlers return `Result<_, GoConnectError>`
    /// and let `IntoResponse` apply this mapping.
    pub fn status_code(&self) -> StatusCode {
        use GoConnectError::*;
        match self {
            Validation(_) => StatusCode::BAD_REQUEST,
            Unauthorized | TokenExpired | InvalidToken | InvalidCredentials => {
                StatusCode::UNAUTHORIZED
            },
            Forbidden | Banned | Kicked => StatusCode::FORBIDDEN,
            NotFound(_) => StatusCode::NOT_FOUND,
            AlreadyMember => StatusCode::OK,
            AlreadyRequested => StatusCode::ACCEPTED,
            Conflict { .. } => StatusCode::CONFLICT,
            RateLimited => StatusCode::TOO_MANY_REQUESTS,
            NotImplemented => StatusCode::NOT_IMPLEMENTED,
            Dependency(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Mirrors `status_code` for the local IPC surface (C10/C11), which
    /// speaks gRPC status codes instead of HTTP.
    pub fn grpc_code(&self) -> tonic::Code {
        use GoConnectError::*;
        match self {
            Validation(_) => tonic::Code::InvalidArgument,
            Unauthorized | TokenExpired | InvalidToken | InvalidCredentials => {
                tonic::Code::Unauthenticated
            },
            Forbidden | Banned | Kicked => tonic::Code::PermissionDenied,
            NotFound(_) => tonic::Code::NotFound,
            AlreadyMember | AlreadyRequested => tonic::Code::Ok,
            Conflict { .. } => tonic::Code::FailedPrecondition,
            RateLimited => tonic::Code::ResourceExhausted,
            NotImplemented => tonic::Code::Unimplemented,
            Dependency(_) | Internal(_) => tonic::Code::Internal,
        }
    }
}

impl From<GoConnectError> for tonic::Status {
    fn from(err: GoConnectError) -> Self {
        tonic::Status::new(err.grpc_code(), err.to_string())
    }
}

/// `{"error": {"code","message","details"}}` per spec §6's response envelope.
#[derive(Serialize)]
struct ErrorBody {
    code: ErrorCode,
    message: String,
    details: serde_json::Value,
}

impl IntoResponse for GoConnectError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            details: json!({}),
        };
        (status, Json(json!({ "error": body }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GoConnectError>;
