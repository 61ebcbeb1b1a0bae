use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The endpoint could not be reached, answered with a non-success
    /// status, or did not answer in time.
    Unavailable,
    /// The model provider is rate limited.
    RateLimitExceeded,
    /// The endpoint answered, but the payload does not have the expected
    /// shape.
    Protocol,
}

impl ErrorKind {
    /// Returns `true` if retrying the same request later may succeed.
    #[inline]
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::RateLimitExceeded)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Unavailable => write!(f, "unavailable"),
            ErrorKind::RateLimitExceeded => write!(f, "rate limited"),
            ErrorKind::Protocol => write!(f, "protocol error"),
        }
    }
}
