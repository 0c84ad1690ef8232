use crate::infrastructure::error::InfraError;
use thiserror::Error;

/// Failure of a session operation. Nothing is mutated when an operation
/// returns one of these, apart from `Collaborator` failures raised by a
/// secondary write after the primary mutation already succeeded.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("collaborator failure: {0}")]
    Collaborator(InfraError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Collaborator(_) => "collaborator_error",
        }
    }
}

impl From<InfraError> for SessionError {
    fn from(error: InfraError) -> Self {
        match error {
            InfraError::NotFound(message) => Self::NotFound(message),
            InfraError::Conflict(message) => Self::InvalidState(message),
            other => Self::Collaborator(other),
        }
    }
}
