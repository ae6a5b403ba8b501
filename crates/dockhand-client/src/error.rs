use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("command rejected: {0}")]
    Rejected(String),
    #[error("job not found")]
    NotFound,
    #[error("stale run '{requested}' (active: {})", active.as_deref().unwrap_or("none"))]
    StaleRun {
        requested: String,
        active: Option<String>,
    },
    #[error("request id expired or already used")]
    StaleRequest,
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("event stream error: {0}")]
    Stream(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl ClientError {
    /// Transport-level failures worth another attempt. Policy outcomes
    /// (rejection, stale run, not found, auth) are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(err) => !err.is_builder() && !err.is_decode(),
            ClientError::Stream(_) | ClientError::StaleRequest => true,
            ClientError::RateLimited { .. } => true,
            ClientError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
