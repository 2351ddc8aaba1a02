//! Connector error taxonomy.
//!
//! Variants follow the retry policy of the task layer: only
//! [`ConnectorError::Transient`] failures are retried; validation,
//! authentication and protocol errors surface to the caller unchanged.

use thiserror::Error;

/// Errors from source/sink API calls.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// The request was malformed or rejected by the remote system.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Credentials were rejected by the remote system.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Network failure, timeout, rate limit or remote 5xx.
    #[error("Transient error: {message}")]
    Transient {
        message: String,
        /// HTTP status, when the failure carried one.
        status: Option<u16>,
    },

    /// The remote system answered with something unparsable.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// The requested entity does not exist in the remote system.
    #[error("Not found: {message}")]
    NotFound { message: String },
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

impl ConnectorError {
    /// Whether the task layer should retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::Transient { .. })
    }

    /// Classify a non-success HTTP status.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {}", truncate(body, 500))
        };
        match status {
            401 | 403 => ConnectorError::Authentication { message },
            404 => ConnectorError::NotFound { message },
            429 | 500..=599 => ConnectorError::Transient {
                message,
                status: Some(status),
            },
            _ => ConnectorError::Validation { message },
        }
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ConnectorError::Transient {
                message: err.to_string(),
                status: None,
            }
        } else if err.is_decode() {
            ConnectorError::Protocol {
                message: err.to_string(),
            }
        } else {
            ConnectorError::Transient {
                message: err.to_string(),
                status: err.status().map(|s| s.as_u16()),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ConnectorError::from_status(401, ""),
            ConnectorError::Authentication { .. }
        ));
        assert!(matches!(
            ConnectorError::from_status(404, ""),
            ConnectorError::NotFound { .. }
        ));
        assert!(matches!(
            ConnectorError::from_status(429, ""),
            ConnectorError::Transient { .. }
        ));
        assert!(matches!(
            ConnectorError::from_status(503, ""),
            ConnectorError::Transient { .. }
        ));
        assert!(matches!(
            ConnectorError::from_status(400, "bad sku"),
            ConnectorError::Validation { .. }
        ));
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(ConnectorError::from_status(502, "").is_retryable());
        assert!(!ConnectorError::from_status(401, "").is_retryable());
        assert!(!ConnectorError::from_status(400, "").is_retryable());
        assert!(!ConnectorError::from_status(404, "").is_retryable());
    }

    #[test]
    fn test_transient_display_includes_status() {
        let err = ConnectorError::from_status(503, "unavailable");
        assert!(err.to_string().contains("503"));
    }
}
