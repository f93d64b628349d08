use serde::{Deserialize, Serialize};

/// The closed set of normalized upstream failure categories. This is the sole
/// currency of error meaning inside the gateway: every HTTP status, parsed
/// JSON error body, and transport failure folds into exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorReason {
    InvalidKey,
    NoAccess,
    NoQuota,
    NoModel,
    RateLimited,
    ServerError,
    Overloaded,
    ServiceUnavailable,
    Timeout,
    NetworkError,
    BadRequest,
    Unknown,
}

impl ErrorReason {
    /// Fatal, account-level failures: no retry will help until the penalty expires.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorReason::InvalidKey | ErrorReason::NoAccess | ErrorReason::NoQuota | ErrorReason::NoModel
        )
    }

    /// Transient upstream failures worth a bounded verification loop.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorReason::RateLimited
                | ErrorReason::ServerError
                | ErrorReason::Timeout
                | ErrorReason::NetworkError
                | ErrorReason::Overloaded
                | ErrorReason::ServiceUnavailable
        )
    }

    /// Default HTTP status -> reason map from spec.md §6, applied when no rule matches.
    pub fn from_http_status(status: u16) -> Option<ErrorReason> {
        if (200..300).contains(&status) {
            return None;
        }
        Some(match status {
            400 => ErrorReason::BadRequest,
            401 => ErrorReason::InvalidKey,
            402 => ErrorReason::NoQuota,
            403 => ErrorReason::NoAccess,
            404 => ErrorReason::NoModel,
            429 => ErrorReason::RateLimited,
            500 => ErrorReason::ServerError,
            502 => ErrorReason::NetworkError,
            503 => ErrorReason::Overloaded,
            504 => ErrorReason::Timeout,
            _ => ErrorReason::Unknown,
        })
    }

    pub fn parse(s: &str) -> Option<ErrorReason> {
        Some(match s {
            "INVALID_KEY" => ErrorReason::InvalidKey,
            "NO_ACCESS" => ErrorReason::NoAccess,
            "NO_QUOTA" => ErrorReason::NoQuota,
            "NO_MODEL" => ErrorReason::NoModel,
            "RATE_LIMITED" => ErrorReason::RateLimited,
            "SERVER_ERROR" => ErrorReason::ServerError,
            "OVERLOADED" => ErrorReason::Overloaded,
            "SERVICE_UNAVAILABLE" => ErrorReason::ServiceUnavailable,
            "TIMEOUT" => ErrorReason::Timeout,
            "NETWORK_ERROR" => ErrorReason::NetworkError,
            "BAD_REQUEST" => ErrorReason::BadRequest,
            "UNKNOWN" => ErrorReason::Unknown,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorReason::InvalidKey => "INVALID_KEY",
            ErrorReason::NoAccess => "NO_ACCESS",
            ErrorReason::NoQuota => "NO_QUOTA",
            ErrorReason::NoModel => "NO_MODEL",
            ErrorReason::RateLimited => "RATE_LIMITED",
            ErrorReason::ServerError => "SERVER_ERROR",
            ErrorReason::Overloaded => "OVERLOADED",
            ErrorReason::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorReason::Timeout => "TIMEOUT",
            ErrorReason::NetworkError => "NETWORK_ERROR",
            ErrorReason::BadRequest => "BAD_REQUEST",
            ErrorReason::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_matches_spec() {
        assert_eq!(ErrorReason::from_http_status(400), Some(ErrorReason::BadRequest));
        assert_eq!(ErrorReason::from_http_status(401), Some(ErrorReason::InvalidKey));
        assert_eq!(ErrorReason::from_http_status(402), Some(ErrorReason::NoQuota));
        assert_eq!(ErrorReason::from_http_status(403), Some(ErrorReason::NoAccess));
        assert_eq!(ErrorReason::from_http_status(404), Some(ErrorReason::NoModel));
        assert_eq!(ErrorReason::from_http_status(429), Some(ErrorReason::RateLimited));
        assert_eq!(ErrorReason::from_http_status(500), Some(ErrorReason::ServerError));
        assert_eq!(ErrorReason::from_http_status(502), Some(ErrorReason::NetworkError));
        assert_eq!(ErrorReason::from_http_status(503), Some(ErrorReason::Overloaded));
        assert_eq!(ErrorReason::from_http_status(504), Some(ErrorReason::Timeout));
        assert_eq!(ErrorReason::from_http_status(418), Some(ErrorReason::Unknown));
        assert_eq!(ErrorReason::from_http_status(200), None);
    }
}
