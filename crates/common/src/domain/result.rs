use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found or insufficient permission")]
    NotFound(String),

    #[error("Delivery error: {0}")]
    DeliveryError(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Insert error: {0}")]
    InsertError(String),

    #[error("Acknowledge error: {0}")]
    AckError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Backend error: {0}")]
    BackendError(#[from] anyhow::Error),
}
