use thiserror::Error;

pub type Result<T> = std::result::Result<T, StageError>;

/// Uniform failure contract for the model clients. Every stage fails with one
/// of these kinds so the coordinator can table-drive its reaction regardless
/// of which stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("stage deadline exceeded")]
    Timeout,
    #[error("backend unreachable: {0}")]
    UpstreamUnavailable(String),
    #[error("backend rejected the request: {0}")]
    UpstreamRejected(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StageError {
    /// Transient failures are worth another attempt; the rest are final.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::UpstreamUnavailable(_))
    }
}
