use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("VALIDATION: {0}")]
    Validation(String),
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("TRANSPORT: {0}")]
    Transport(String),
    #[error("WRITER_UNAVAILABLE: {0}")]
    WriterUnavailable(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Wire code used by the bridge protocol.
    pub fn protocol_code(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::NotFound(_) => "VALIDATION",
            Self::Conflict(_) => "CONFLICT",
            Self::Io(_) | Self::Transport(_) | Self::WriterUnavailable(_) | Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Validation(message)
            | Self::Conflict(message)
            | Self::NotFound(message)
            | Self::Io(message)
            | Self::Transport(message)
            | Self::WriterUnavailable(message)
            | Self::Internal(message) => message,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Validation(format!("invalid config: {}", value))
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Internal(format!("background task failed: {}", value))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
