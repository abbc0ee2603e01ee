//! Error types for gemchat.
//!
//! Every fallible operation in the crate returns [`Error`], whether it fails while building the
//! client, talking to the Gemini API, or decoding a streamed response.

use std::error;
use std::fmt;
use std::str::Utf8Error;
use std::sync::Arc;

/// The main error type for gemchat.
#[derive(Clone, Debug)]
pub enum Error {
    /// A generic API error occurred.
    Api {
        /// HTTP status code.
        status_code: u16,
        /// Canonical status string from the API (e.g. `INVALID_ARGUMENT`).
        status: Option<String>,
        /// Human-readable error message.
        message: String,
    },

    /// The API rejected the credential.
    Authentication {
        /// Human-readable error message.
        message: String,
    },

    /// The credential is valid but lacks access to the resource.
    Permission {
        /// Human-readable error message.
        message: String,
    },

    /// Resource not found, usually an unknown model.
    NotFound {
        /// Human-readable error message.
        message: String,
    },

    /// Rate limit or quota exceeded.
    RateLimit {
        /// Human-readable error message.
        message: String,
        /// Time to wait before retrying, in seconds.
        retry_after: Option<u64>,
    },

    /// Bad request due to invalid parameters.
    BadRequest {
        /// Human-readable error message.
        message: String,
    },

    /// The request timed out.
    Timeout {
        /// Human-readable error message.
        message: String,
        /// Duration of the timeout in seconds.
        duration: Option<f64>,
    },

    /// Connection error.
    Connection {
        /// Human-readable error message.
        message: String,
        /// Underlying cause.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// Server returned a 500 internal error.
    InternalServer {
        /// Human-readable error message.
        message: String,
    },

    /// Server is overloaded or unavailable.
    ServiceUnavailable {
        /// Human-readable error message.
        message: String,
        /// Time to wait before retrying, in seconds.
        retry_after: Option<u64>,
    },

    /// Error during JSON serialization or deserialization.
    Serialization {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// HTTP client error.
    HttpClient {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// A caller-supplied value was rejected.
    Validation {
        /// Human-readable error message.
        message: String,
        /// Parameter that failed validation.
        param: Option<String>,
    },

    /// Required configuration is missing or malformed.
    Configuration {
        /// Human-readable error message.
        message: String,
        /// The configuration key at fault.
        key: Option<String>,
    },

    /// A URL parsing or manipulation error.
    Url {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<url::ParseError>,
    },

    /// A streaming error occurred.
    Streaming {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// Encoding/decoding error.
    Encoding {
        /// Human-readable error message.
        message: String,
        /// The underlying error.
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    },

    /// The prompt was blocked by the provider's safety filters.
    Blocked {
        /// The block reason reported by the API.
        reason: String,
    },
}

impl Error {
    /// Creates a new API error.
    pub fn api(status_code: u16, status: Option<String>, message: impl Into<String>) -> Self {
        Error::Api {
            status_code,
            status,
            message: message.into(),
        }
    }

    /// Creates a new authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Error::Authentication {
            message: message.into(),
        }
    }

    /// Creates a new permission error.
    pub fn permission(message: impl Into<String>) -> Self {
        Error::Permission {
            message: message.into(),
        }
    }

    /// Creates a new not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Error::NotFound {
            message: message.into(),
        }
    }

    /// Creates a new rate limit error.
    pub fn rate_limit(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Error::RateLimit {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a new bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Error::BadRequest {
            message: message.into(),
        }
    }

    /// Creates a new timeout error.
    pub fn timeout(message: impl Into<String>, duration: Option<f64>) -> Self {
        Error::Timeout {
            message: message.into(),
            duration,
        }
    }

    /// Creates a new connection error.
    pub fn connection(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Connection {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new internal server error.
    pub fn internal_server(message: impl Into<String>) -> Self {
        Error::InternalServer {
            message: message.into(),
        }
    }

    /// Creates a new service unavailable error.
    pub fn service_unavailable(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Error::ServiceUnavailable {
            message: message.into(),
            retry_after,
        }
    }

    /// Creates a new serialization error.
    pub fn serialization(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Serialization {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new HTTP client error.
    pub fn http_client(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::HttpClient {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new validation error.
    pub fn validation(message: impl Into<String>, param: Option<String>) -> Self {
        Error::Validation {
            message: message.into(),
            param,
        }
    }

    /// Creates a new configuration error.
    pub fn configuration(message: impl Into<String>, key: Option<String>) -> Self {
        Error::Configuration {
            message: message.into(),
            key,
        }
    }

    /// Creates a new URL error.
    pub fn url(message: impl Into<String>, source: Option<url::ParseError>) -> Self {
        Error::Url {
            message: message.into(),
            source,
        }
    }

    /// Creates a new streaming error.
    pub fn streaming(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Streaming {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new encoding error.
    pub fn encoding(
        message: impl Into<String>,
        source: Option<Box<dyn error::Error + Send + Sync>>,
    ) -> Self {
        Error::Encoding {
            message: message.into(),
            source: source.map(Arc::from),
        }
    }

    /// Creates a new blocked-prompt error.
    pub fn blocked(reason: impl Into<String>) -> Self {
        Error::Blocked {
            reason: reason.into(),
        }
    }

    /// Returns true if this error is related to authentication.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Error::Authentication { .. })
    }

    /// Returns true if this error is related to rate limiting.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimit { .. })
    }

    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Returns true if this error is a connection error.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    /// Returns true if this error is a server error.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Error::InternalServer { .. } | Error::ServiceUnavailable { .. }
        )
    }

    /// Returns true if this error is a validation error.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Returns true if this error is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration { .. })
    }

    /// Returns true if this error is a streaming error.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Error::Streaming { .. })
    }

    /// Returns true if the prompt was blocked.
    pub fn is_blocked(&self) -> bool {
        matches!(self, Error::Blocked { .. })
    }

    /// Returns true if resubmitting the same request could succeed.
    ///
    /// Nothing in gemchat retries automatically; this exists for callers that want to.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api { status_code, .. } => {
                matches!(status_code, 408 | 409 | 429 | 500..=599)
            }
            Error::Timeout { .. } => true,
            Error::Connection { .. } => true,
            Error::RateLimit { .. } => true,
            Error::ServiceUnavailable { .. } => true,
            Error::InternalServer { .. } => true,
            _ => false,
        }
    }

    /// Returns the status code associated with this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Api { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Api {
                status_code,
                status,
                message,
            } => {
                if let Some(status) = status {
                    write!(f, "{status} ({status_code}): {message}")
                } else {
                    write!(f, "API error ({status_code}): {message}")
                }
            }
            Error::Authentication { message } => {
                write!(f, "Authentication error: {message}")
            }
            Error::Permission { message } => {
                write!(f, "Permission error: {message}")
            }
            Error::NotFound { message } => {
                write!(f, "Resource not found: {message}")
            }
            Error::RateLimit {
                message,
                retry_after,
            } => {
                if let Some(retry_after) = retry_after {
                    write!(
                        f,
                        "Rate limit exceeded: {message} (retry after {retry_after} seconds)"
                    )
                } else {
                    write!(f, "Rate limit exceeded: {message}")
                }
            }
            Error::BadRequest { message } => {
                write!(f, "Bad request: {message}")
            }
            Error::Timeout { message, duration } => {
                if let Some(duration) = duration {
                    write!(f, "Timeout error: {message} ({duration} seconds)")
                } else {
                    write!(f, "Timeout error: {message}")
                }
            }
            Error::Connection { message, .. } => {
                write!(f, "Connection error: {message}")
            }
            Error::InternalServer { message } => {
                write!(f, "Internal server error: {message}")
            }
            Error::ServiceUnavailable {
                message,
                retry_after,
            } => {
                if let Some(retry_after) = retry_after {
                    write!(
                        f,
                        "Service unavailable: {message} (retry after {retry_after} seconds)"
                    )
                } else {
                    write!(f, "Service unavailable: {message}")
                }
            }
            Error::Serialization { message, .. } => {
                write!(f, "Serialization error: {message}")
            }
            Error::HttpClient { message, .. } => {
                write!(f, "HTTP client error: {message}")
            }
            Error::Validation { message, param } => {
                if let Some(param) = param {
                    write!(f, "Validation error: {message} (parameter: {param})")
                } else {
                    write!(f, "Validation error: {message}")
                }
            }
            Error::Configuration { message, key } => {
                if let Some(key) = key {
                    write!(f, "Configuration error: {message} (key: {key})")
                } else {
                    write!(f, "Configuration error: {message}")
                }
            }
            Error::Url { message, .. } => {
                write!(f, "URL error: {message}")
            }
            Error::Streaming { message, .. } => {
                write!(f, "Streaming error: {message}")
            }
            Error::Encoding { message, .. } => {
                write!(f, "Encoding error: {message}")
            }
            Error::Blocked { reason } => {
                write!(f, "Prompt blocked: {reason}")
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Connection { source, .. }
            | Error::Serialization { source, .. }
            | Error::HttpClient { source, .. }
            | Error::Streaming { source, .. }
            | Error::Encoding { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &(dyn error::Error + 'static)),
            Error::Url { source, .. } => {
                source.as_ref().map(|e| e as &(dyn error::Error + 'static))
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(format!("JSON error: {err}"), Some(Box::new(err)))
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::url(format!("URL parse error: {err}"), Some(err))
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Self {
        Error::encoding(format!("UTF-8 error: {err}"), Some(Box::new(err)))
    }
}

/// A specialized Result type for gemchat operations.
pub type Result<T> = std::result::Result<T, Error>;
