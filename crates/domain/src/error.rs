use thiserror::Error;

use crate::ports::store::StoreError;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("message request already resolved")]
    AlreadyResolved,
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        DomainError::TransactionFailed(err.to_string())
    }
}
