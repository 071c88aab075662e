//! Fetch error taxonomy.
//!
//! A single closed sum type covers every way a weather fetch can fail.
//! Classification from the underlying transport error happens exactly once,
//! here; everything downstream only asks `is_retryable()` or renders a
//! recovery suggestion.

use thiserror::Error;

/// Every failure kind the acquisition core can produce.
///
/// Retryable: `NoConnectivity`, `Timeout`, `ServerError`, `RateLimited`.
/// Everything else is terminal for the attempt loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("No network connectivity")]
    NoConnectivity,

    #[error("Request timed out")]
    Timeout,

    #[error("Server error ({status})")]
    ServerError { status: u16 },

    #[error("Rate limited by the weather service")]
    RateLimited,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Failed to decode response: {0}")]
    DecodeFailure(String),

    #[error("Resource not found")]
    NotFound,

    #[error("Location access denied")]
    LocationDenied,

    #[error("Unexpected error: {0}")]
    Unknown(String),
}

impl FetchError {
    /// Whether the retry loop may try this operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoConnectivity | Self::Timeout | Self::ServerError { .. } | Self::RateLimited
        )
    }

    /// User-facing recovery suggestion, shown only after the network path
    /// and the cache fallback have both failed.
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            Self::NoConnectivity => "Check your internet connection and try again.",
            Self::Timeout => "The weather service is slow to respond. Try again in a moment.",
            Self::ServerError { .. } => "The weather service is having trouble. Try again later.",
            Self::RateLimited => "Too many requests. Please wait a moment before refreshing.",
            Self::InvalidResponse(_) | Self::DecodeFailure(_) => {
                "Received unreadable weather data. Try refreshing."
            }
            Self::NotFound => "No weather data is available for this location.",
            Self::LocationDenied => "Allow location access to see local weather.",
            Self::Unknown(_) => "Something went wrong. Please try again.",
        }
    }

    /// Classify an HTTP status that reached us as a response.
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status.is_server_error() {
            return Self::ServerError { status: status.as_u16() };
        }
        match status {
            reqwest::StatusCode::TOO_MANY_REQUESTS => Self::RateLimited,
            reqwest::StatusCode::REQUEST_TIMEOUT => Self::Timeout,
            reqwest::StatusCode::NOT_FOUND => Self::NotFound,
            other => Self::InvalidResponse(format!("unexpected status {}", other)),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            tracing::debug!("Transport timeout: {}", error);
            return Self::Timeout;
        }
        if error.is_connect() {
            tracing::debug!("Connection failure: {}", error);
            return Self::NoConnectivity;
        }
        if let Some(status) = error.status() {
            return Self::from_status(status);
        }
        if error.is_decode() {
            return Self::DecodeFailure(error.to_string());
        }
        Self::Unknown(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_retryable_kinds() {
        assert!(FetchError::NoConnectivity.is_retryable());
        assert!(FetchError::Timeout.is_retryable());
        assert!(FetchError::ServerError { status: 503 }.is_retryable());
        assert!(FetchError::RateLimited.is_retryable());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(!FetchError::InvalidResponse("bad".into()).is_retryable());
        assert!(!FetchError::DecodeFailure("bad json".into()).is_retryable());
        assert!(!FetchError::NotFound.is_retryable());
        assert!(!FetchError::LocationDenied.is_retryable());
        assert!(!FetchError::Unknown("???".into()).is_retryable());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(
            FetchError::from_status(StatusCode::INTERNAL_SERVER_ERROR),
            FetchError::ServerError { status: 500 }
        );
        assert_eq!(
            FetchError::from_status(StatusCode::BAD_GATEWAY),
            FetchError::ServerError { status: 502 }
        );
        assert_eq!(FetchError::from_status(StatusCode::TOO_MANY_REQUESTS), FetchError::RateLimited);
        assert_eq!(FetchError::from_status(StatusCode::REQUEST_TIMEOUT), FetchError::Timeout);
        assert_eq!(FetchError::from_status(StatusCode::NOT_FOUND), FetchError::NotFound);
        assert!(matches!(
            FetchError::from_status(StatusCode::BAD_REQUEST),
            FetchError::InvalidResponse(_)
        ));
    }

    #[test]
    fn test_recovery_suggestions_nonempty() {
        let kinds = [
            FetchError::NoConnectivity,
            FetchError::Timeout,
            FetchError::ServerError { status: 500 },
            FetchError::RateLimited,
            FetchError::InvalidResponse("x".into()),
            FetchError::DecodeFailure("x".into()),
            FetchError::NotFound,
            FetchError::LocationDenied,
            FetchError::Unknown("x".into()),
        ];
        for kind in kinds {
            assert!(!kind.recovery_suggestion().is_empty());
        }
    }
}
