use thiserror::Error;

/// Main error type for health-insights
#[derive(Error, Debug)]
pub enum InsightsError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Write conflict on {metric_code} after {attempts} attempts")]
    Conflict { metric_code: String, attempts: u32 },

    #[error("Decimal overflow while merging {0}")]
    Overflow(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid date format: {0}. Expected YYYY-MM-DD")]
    InvalidDateFormat(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, InsightsError>;

impl InsightsError {
    /// Create a store error from a message
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an invalid request error from a message
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a configuration error from a message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Reasons a single change-event is dropped from a batch.
///
/// These never abort the batch; the grouper counts and logs them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SampleError {
    #[error("missing attribute `{0}`")]
    MissingField(&'static str),

    #[error("attribute `{0}` is neither a string nor a number")]
    UnsupportedAttribute(&'static str),

    #[error("malformed health context `{0}`")]
    MalformedContext(String),

    #[error("invalid sample date `{0}`")]
    InvalidDate(String),

    #[error("invalid quantity `{0}`")]
    InvalidQuantity(String),

    #[error("unknown metric type `{0}`")]
    UnknownMetric(String),

    #[error("qualifier `{qualifier}` is not allowed for `{metric}`")]
    QualifierNotAllowed { metric: String, qualifier: String },
}
