//! Error types for the forge clients.

use companion_core::CheckError;
use thiserror::Error;

/// Errors raised while talking to GitHub or GitLab.
#[derive(Error, Debug)]
pub enum ForgeError {
    /// The connection could not be established; the request never reached
    /// the server.
    #[error("connection failed: {0}")]
    Connect(String),

    /// Transport failure after the request may have been sent (reset,
    /// timeout).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Non-success status other than 404.
    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("not found: {url}")]
    NotFound { url: String },

    /// Response body did not have the expected shape.
    #[error("unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },

    /// Transient failures outlasted the retry budget.
    #[error("{service} unavailable after {attempts} attempts: {detail}")]
    Exhausted {
        service: String,
        attempts: u32,
        detail: String,
    },

    #[error("client configuration error: {0}")]
    Config(String),
}

impl ForgeError {
    /// Worth retrying: transport failures, 5xx and 429.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// The server never saw the request, so even a non-idempotent request
    /// can be repeated.
    pub fn is_unsent(&self) -> bool {
        matches!(self, Self::Connect(_))
    }

    /// Convert for `service`, treating everything as unavailability.
    pub fn into_check_error(self, service: &str) -> CheckError {
        match self {
            Self::Exhausted {
                service,
                attempts,
                detail,
            } => CheckError::RemoteUnavailable {
                service,
                attempts,
                detail,
            },
            Self::Config(reason) => CheckError::Config(reason),
            other => CheckError::RemoteUnavailable {
                service: service.to_string(),
                attempts: 1,
                detail: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            ForgeError::Connect(err.to_string())
        } else {
            ForgeError::Http(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let status = |status| ForgeError::Status {
            url: "u".to_string(),
            status,
            body: String::new(),
        };
        assert!(status(502).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(401).is_transient());
        assert!(ForgeError::Http("reset".to_string()).is_transient());
        assert!(!ForgeError::NotFound { url: "u".to_string() }.is_transient());
    }

    #[test]
    fn test_only_connect_failures_are_unsent() {
        assert!(ForgeError::Connect("refused".to_string()).is_unsent());
        assert!(ForgeError::Connect("refused".to_string()).is_transient());
        assert!(!ForgeError::Http("reset".to_string()).is_unsent());
        assert!(!ForgeError::Status {
            url: "u".to_string(),
            status: 502,
            body: String::new(),
        }
        .is_unsent());
    }

    #[test]
    fn test_exhausted_maps_to_remote_unavailable() {
        let err = ForgeError::Exhausted {
            service: "github".to_string(),
            attempts: 3,
            detail: "502".to_string(),
        }
        .into_check_error("ignored");
        assert!(matches!(
            err,
            CheckError::RemoteUnavailable { ref service, attempts: 3, .. } if service == "github"
        ));
    }
}
