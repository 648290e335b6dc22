use thiserror::Error;

/// Every rejection the relay reports to a caller.
///
/// `code()` is the stable wire string, `status()` the HTTP status it maps to.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("worldId is required")]
    WorldIdRequired,
    #[error("worldId is not in the allow-list")]
    WorldIdForbidden,
    #[error("message text is empty")]
    Empty,
    #[error("message text exceeds {max} characters")]
    TooLong { max: usize },
    #[error("path is required")]
    PathRequired,
    #[error("value is not valid JSON")]
    InvalidValue,
    #[error("delta must be a finite number")]
    InvalidDelta,
    #[error("invalid document name")]
    InvalidDoc,
    #[error("username is required")]
    UsernameRequired,
    #[error("write token missing or wrong")]
    Unauthorized,
    #[error("too many writes, retry later")]
    RateLimited,
    #[error("document could not be persisted: {0}")]
    Persist(String),
    #[error("malformed request")]
    BadRequest,
    #[error("not found")]
    NotFound,
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::WorldIdRequired => "worldId-required",
            RelayError::WorldIdForbidden => "worldId-forbidden",
            RelayError::Empty => "empty",
            RelayError::TooLong { .. } => "too-long",
            RelayError::PathRequired => "path-required",
            RelayError::InvalidValue => "invalid-value",
            RelayError::InvalidDelta => "invalid-delta",
            RelayError::InvalidDoc => "invalid-doc",
            RelayError::UsernameRequired => "username-required",
            RelayError::Unauthorized => "unauthorized",
            RelayError::RateLimited => "rate-limit",
            RelayError::Persist(_) => "persist-failed",
            RelayError::BadRequest => "bad-request",
            RelayError::NotFound => "not-found",
            RelayError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            RelayError::Unauthorized => 401,
            RelayError::WorldIdForbidden => 403,
            RelayError::NotFound => 404,
            RelayError::RateLimited => 429,
            RelayError::Persist(_) | RelayError::Internal(_) => 500,
            _ => 400,
        }
    }

    /// Server-side failures: detail stays in the log, callers only see the code.
    pub fn is_server_side(&self) -> bool {
        self.status() >= 500
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_wire_contract() {
        assert_eq!(RelayError::WorldIdRequired.code(), "worldId-required");
        assert_eq!(RelayError::TooLong { max: 10 }.code(), "too-long");
        assert_eq!(RelayError::RateLimited.code(), "rate-limit");
        assert_eq!(RelayError::Persist("disk".into()).code(), "persist-failed");
    }

    #[test]
    fn test_status_taxonomy() {
        assert_eq!(RelayError::Empty.status(), 400);
        assert_eq!(RelayError::Unauthorized.status(), 401);
        assert_eq!(RelayError::WorldIdForbidden.status(), 403);
        assert_eq!(RelayError::RateLimited.status(), 429);
        assert!(RelayError::Internal("x".into()).is_server_side());
        assert!(!RelayError::InvalidValue.is_server_side());
    }
}
