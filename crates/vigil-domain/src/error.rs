use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device already exists: {0}")]
    DeviceAlreadyExists(String),

    #[error("Invalid point: {0}")]
    InvalidPoint(String),

    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Detector unavailable: {0}")]
    DetectorUnavailable(String),

    #[error("Pipeline is shutting down")]
    ShuttingDown,

    #[error("Repository error: {0}")]
    RepositoryError(#[from] anyhow::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;
