//! Error types for the console-poller crate.
//!
//! Fetch failures never escape a [`PollerStream`](crate::PollerStream); they are
//! recorded in its error history. The types here describe those failures and the
//! few construction-time errors the crate can return.

/// How a failed fetch should be treated by the give-up heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Worth retrying; counts towards the "last N attempts" window.
    Transient,
    /// Will not fix itself (expired session, missing permission).
    Permanent,
}

/// Errors produced by a fetch capability.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    /// The request never produced a response (connect error, timeout, reset)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status code
    #[error("Server responded with status {status} for {url}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// The response body did not match the expected payload type
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    /// The resource key could not be turned into a request
    #[error("Invalid resource key: {0}")]
    InvalidKey(String),
}

impl FetchError {
    /// Classify this error for the give-up heuristic.
    ///
    /// Authentication and authorization rejections (401, 403) are permanent;
    /// every other failure is transient.
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Status { status, .. } if matches!(status, 401 | 403) => {
                FailureKind::Permanent
            }
            FetchError::InvalidKey(_) => FailureKind::Permanent,
            _ => FailureKind::Transient,
        }
    }

    /// Shorthand for `kind() == FailureKind::Permanent`.
    pub fn is_permanent(&self) -> bool {
        self.kind() == FailureKind::Permanent
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return FetchError::Status {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        if err.is_decode() {
            return FetchError::Decode(err.to_string());
        }
        FetchError::Transport(err.to_string())
    }
}

/// Errors returned when building poller components.
#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    /// The registry was built outside of a tokio runtime
    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// A fetch failed outside of a stream
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
}

/// Convenience type alias for Results using PollerError.
pub type Result<T> = std::result::Result<T, PollerError>;
