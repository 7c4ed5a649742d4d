use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not found")]
    NotFound,
    #[error("storage not connected")]
    NotConnected,
    #[error("chunk discarded")]
    Discarded,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("configuration: {0}")]
    Config(String),
    #[error("service not running")]
    NotRunning,
    #[error("internal: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound)
    }

    pub fn is_discarded(&self) -> bool {
        matches!(self, SyncError::Discarded)
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, SyncError::NotConnected)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        SyncError::Internal(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        SyncError::InvalidRequest(message.into())
    }
}

impl From<syncline_api::validation::ValidationError> for SyncError {
    fn from(err: syncline_api::validation::ValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}
