use thiserror::Error;

/// Errors that abort a sampling or post-processing call.
///
/// Candidates that leave the parameter bounds or produce non-finite
/// residuals are not errors; they are rejected inside the acceptance rule.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DramError {
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("{what} is not symmetric positive definite")]
    NotPositiveDefinite { what: &'static str },
    #[error("Invalid distribution parameters: {0}")]
    InvalidDistribution(String),
    #[error("Model function returned unrecoverable error")]
    ModelFailure(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Model for dataset {dataset} returned {found} values, expected {expected}")]
    ResidualLength {
        dataset: usize,
        expected: usize,
        found: usize,
    },
    #[error("Checkpoint failed")]
    Checkpoint(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, DramError>;

pub(crate) fn validation(msg: impl Into<String>) -> DramError {
    DramError::Validation(msg.into())
}

impl DramError {
    pub(crate) fn checkpoint(err: anyhow::Error) -> Self {
        DramError::Checkpoint(err.into())
    }
}
