use serde_json::Value;
use thiserror::Error;

pub type Result<T, E = GithubError> = std::result::Result<T, E>;

/// Error raised by the GitHub client.
///
/// Variants map to the classes of failure a caller can meaningfully react
/// to: retry after `reset` for [`GithubError::RateLimit`], re-authenticate
/// for [`GithubError::Authentication`], defer for
/// [`GithubError::Connection`], and so on. Where the failure came from an
/// HTTP response, the status and the parsed response body ride along.
#[derive(Debug, Error)]
pub enum GithubError {
    #[error("authentication failed: {message}")]
    Authentication {
        message: String,
        status: Option<u16>,
        body: Option<Value>,
    },

    /// The hourly quota is exhausted (or close enough that the governor
    /// refused to dispatch). Carries the fields needed to wait it out.
    #[error("rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        /// Unix timestamp at which the quota resets.
        reset: Option<u64>,
        remaining: u64,
        limit: u64,
    },

    #[error("not found: {message}")]
    NotFound {
        message: String,
        status: Option<u16>,
        body: Option<Value>,
    },

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        status: Option<u16>,
        body: Option<Value>,
    },

    /// A 5xx from the server. Counts against the circuit breaker and is
    /// retried by the pipeline.
    #[error("server error: {message}")]
    Server {
        message: String,
        status: u16,
        body: Option<Value>,
    },

    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("request timed out: {message}")]
    Timeout { message: String },

    /// Anything that doesn't classify more precisely.
    #[error("github api error: {message}")]
    Api {
        message: String,
        status: Option<u16>,
        body: Option<Value>,
    },
}

impl GithubError {
    pub fn authentication(message: impl Into<String>) -> Self {
        GithubError::Authentication {
            message: message.into(),
            status: None,
            body: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        GithubError::Validation {
            message: message.into(),
            status: None,
            body: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        GithubError::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        GithubError::Timeout {
            message: message.into(),
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        GithubError::Api {
            message: message.into(),
            status: None,
            body: None,
        }
    }

    /// HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            GithubError::Authentication { status, .. }
            | GithubError::NotFound { status, .. }
            | GithubError::Validation { status, .. }
            | GithubError::Api { status, .. } => *status,
            GithubError::Server { status, .. } => Some(*status),
            GithubError::RateLimit { .. }
            | GithubError::Connection { .. }
            | GithubError::Timeout { .. } => None,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, GithubError::RateLimit { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GithubError::NotFound { .. })
    }

    pub fn is_server(&self) -> bool {
        matches!(self, GithubError::Server { .. })
    }

    /// Whether the pipeline may retry after this error. Transport failures,
    /// timeouts and 5xx responses qualify; everything else surfaces as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GithubError::Server { .. } | GithubError::Connection { .. } | GithubError::Timeout { .. }
        )
    }
}
