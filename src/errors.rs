use axum::http::StatusCode;

/// Semantic error taxonomy for the job pipeline. Variants map to retry
/// decisions in the worker loop and to HTTP status codes at the intake
/// boundary; they are not meant to mirror any particular external API's
/// error shape.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CoordinatorError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("webhook secret missing")]
    SecretMissing,

    #[error("webhook secret mismatch")]
    SecretMismatch,

    #[error("transient external failure: {0}")]
    Transient(String),

    #[error("permanent external failure: {0}")]
    Permanent(String),

    #[error("pipeline broken pipe: {0}")]
    BrokenPipe(String),

    #[error("soft time limit exceeded")]
    SoftTimeout,

    #[error("hard time limit exceeded")]
    HardTimeout,

    #[error("configuration error: {0}")]
    Config(String),
}

impl CoordinatorError {
    /// Whether the worker should requeue the job with backoff, as opposed to
    /// recording it as a terminal failure.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::Transient(_))
    }

    pub(crate) fn http_status(&self) -> StatusCode {
        match self {
            CoordinatorError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CoordinatorError::SecretMissing => StatusCode::UNAUTHORIZED,
            CoordinatorError::SecretMismatch => StatusCode::FORBIDDEN,
            CoordinatorError::Transient(_)
            | CoordinatorError::Permanent(_)
            | CoordinatorError::BrokenPipe(_)
            | CoordinatorError::SoftTimeout
            | CoordinatorError::HardTimeout
            | CoordinatorError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
