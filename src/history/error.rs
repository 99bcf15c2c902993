//! Errors surfaced by the history manager.

use validator::{ValidationError, ValidationErrors};

use crate::database::StoreError;

pub type Result<T> = std::result::Result<T, HistoryError>;

/// Outcome of a failed history operation.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error("user not found")]
    UserNotFound,

    #[error("history storage failed")]
    Storage(#[source] StoreError),
}

impl From<StoreError> for HistoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ForeignKey => HistoryError::UserNotFound,
            err => HistoryError::Storage(err),
        }
    }
}

/// Validation error raised when no IP address is given to delete.
pub(crate) fn empty_ips() -> ValidationErrors {
    let mut errors = ValidationErrors::new();
    errors.add(
        "ips",
        ValidationError::new("length")
            .with_message("At least one IP address is required.".into()),
    );
    errors
}
