use rusqlite::ErrorCode;
use serde::Serialize;

/// Errors surfaced by the graph store and the engines built on it.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("resource exceeded: {0}")]
    ResourceExceeded(String),

    #[error("extraction failed for {path}: {message}")]
    Extraction { path: String, message: String },

    #[error("storage error: {0}")]
    Storage(rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Stable snake_case tag used in structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ConstraintViolation(_) => "constraint_violation",
            Self::IntegrityError(_) => "integrity_error",
            Self::ResourceExceeded(_) => "resource_exceeded",
            Self::Extraction { .. } => "extraction_failed",
            Self::Storage(_) => "storage_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            error: ErrorBody {
                kind: self.kind(),
                message: self.to_string(),
            },
        }
    }
}

impl From<rusqlite::Error> for GraphError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == ErrorCode::ConstraintViolation =>
            {
                let detail = msg.clone().unwrap_or_else(|| code.to_string());
                Self::ConstraintViolation(detail)
            }
            _ => Self::Storage(err),
        }
    }
}

/// `{"error": {"kind": ..., "message": ...}}`
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}
