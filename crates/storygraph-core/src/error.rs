use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoryGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String, raw: String },

    #[error("Patch instruction error: {0}")]
    PatchInstruction(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("Pipeline busy: {0}")]
    PipelineBusy(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl StoryGraphError {
    /// Whether the dispatch boundary may retry this error with backoff.
    /// Malformed responses are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited(_))
    }
}

pub type Result<T> = std::result::Result<T, StoryGraphError>;
