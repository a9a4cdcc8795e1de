use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Error taxonomy surfaced to callers. Every variant maps to a stable
/// `error.code` string; the set is fixed, callers key off it.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} is still active; retry with force=true")]
    SessionActive(String),

    #[error("session {0} already has a queued execution")]
    SessionBusy(String),

    #[error("session {0} container has exited")]
    SessionCrashed(String),

    #[error("maximum number of sessions reached")]
    CapacityExhausted { max_sessions: usize },

    #[error("{0}")]
    InvalidPath(String),

    #[error("{message}")]
    FileTooLarge { message: String, limit_bytes: usize },

    #[error("{message}")]
    Timeout { message: String, retryable: bool },

    // Daemon-side detail is logged, never shown to callers.
    #[error("container runtime is unavailable")]
    RuntimeUnavailable { detail: String },

    #[error("image {0} is not present at the container runtime")]
    ImageMissing(String),

    #[error("evaluator for session {0} is unreachable")]
    EvaluatorUnreachable(String),

    #[error("{message}")]
    InvalidArgument {
        message: String,
        details: Option<Value>,
    },

    #[error("internal error (correlation id {correlation_id})")]
    Internal { correlation_id: Uuid },
}

impl SandboxError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            details: None,
        }
    }

    pub fn invalid_argument_with(message: impl Into<String>, details: Value) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn runtime_unavailable(detail: impl Into<String>) -> Self {
        Self::RuntimeUnavailable {
            detail: detail.into(),
        }
    }

    /// Catch-all for unexpected failures. The underlying cause is logged with
    /// a correlation id; the caller only ever sees the id.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4();
        error!(%correlation_id, "internal error: {cause}");
        Self::Internal { correlation_id }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionActive(_) => "session_active",
            Self::SessionBusy(_) => "session_busy",
            Self::SessionCrashed(_) => "session_crashed",
            Self::CapacityExhausted { .. } => "capacity_exhausted",
            Self::InvalidPath(_) => "invalid_path",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::Timeout { .. } => "timeout",
            Self::RuntimeUnavailable { .. } => "runtime_unavailable",
            Self::ImageMissing(_) => "image_missing",
            Self::EvaluatorUnreachable(_) => "evaluator_unreachable",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            Self::SessionActive(_)
            | Self::SessionBusy(_)
            | Self::CapacityExhausted { .. }
            | Self::RuntimeUnavailable { .. }
            | Self::EvaluatorUnreachable(_) => true,
            Self::Timeout { retryable, .. } => *retryable,
            _ => false,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::CapacityExhausted { max_sessions } => {
                Some(json!({ "max_sessions": max_sessions }))
            }
            Self::FileTooLarge { limit_bytes, .. } => Some(json!({ "limit_bytes": limit_bytes })),
            Self::InvalidArgument { details, .. } => details.clone(),
            _ => None,
        }
    }

    /// Render the failure half of the response envelope.
    pub fn envelope(&self) -> Value {
        let mut err = json!({
            "code": self.code(),
            "message": self.to_string(),
            "retryable": self.retryable(),
        });
        if let Some(details) = self.details() {
            err["details"] = details;
        }
        json!({ "success": false, "error": err })
    }
}
