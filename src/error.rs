use thiserror::Error;

/// Errors produced by the analysis core.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad constructor or call arguments. Always a caller bug.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The decoder (or anything underneath it) failed during analysis.
    #[error("analysis failed: {0}")]
    AnalysisFailure(String),

    /// Cooperative cancellation. Never surfaced to observers.
    #[error("analysis cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::InvalidConfiguration(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::AnalysisFailure(err.to_string())
    }
}

impl From<symphonia::core::errors::Error> for Error {
    fn from(err: symphonia::core::errors::Error) -> Self {
        Error::AnalysisFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
