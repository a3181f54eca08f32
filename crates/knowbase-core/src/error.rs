use thiserror::Error;

/// Coarse classification used by callers to decide whether to retry,
/// surface a user-facing message, or treat the failure as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KbErrorKind {
    InputInvalid,
    Unauthorized,
    NotFound,
    Conflict,
    Storage,
    Embedding,
    Cancelled,
    Integrity,
}

#[derive(Debug, Error)]
pub enum KbError {
    #[error("invalid input: {message}")]
    InputInvalid { message: String },

    #[error("unauthorized: {action}")]
    Unauthorized { action: String },

    #[error("not found: {entity}")]
    NotFound { entity: String },

    #[error("conflict: {message}")]
    Conflict { message: String },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("embedding error: {message}")]
    Embedding { message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("integrity violation: {message}")]
    Integrity { message: String },
}

impl KbError {
    pub fn kind(&self) -> KbErrorKind {
        match self {
            Self::InputInvalid { .. } => KbErrorKind::InputInvalid,
            Self::Unauthorized { .. } => KbErrorKind::Unauthorized,
            Self::NotFound { .. } => KbErrorKind::NotFound,
            Self::Conflict { .. } => KbErrorKind::Conflict,
            Self::Storage { .. } => KbErrorKind::Storage,
            Self::Embedding { .. } => KbErrorKind::Embedding,
            Self::Cancelled => KbErrorKind::Cancelled,
            Self::Integrity { .. } => KbErrorKind::Integrity,
        }
    }

    /// Whether a caller may reasonably retry the same operation unmodified.
    pub fn retryable(&self) -> bool {
        matches!(self.kind(), KbErrorKind::Storage | KbErrorKind::Embedding)
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InputInvalid { .. } => "INPUT_INVALID",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Embedding { .. } => "EMBEDDING_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Integrity { .. } => "INTEGRITY",
        }
    }

    pub fn input_invalid(message: impl Into<String>) -> Self {
        Self::InputInvalid {
            message: message.into(),
        }
    }

    pub fn unauthorized(action: impl Into<String>) -> Self {
        Self::Unauthorized {
            action: action.into(),
        }
    }

    pub fn not_found(entity: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding {
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for KbError {
    fn from(error: std::io::Error) -> Self {
        Self::storage(error.to_string())
    }
}

pub type KbResult<T> = Result<T, KbError>;
