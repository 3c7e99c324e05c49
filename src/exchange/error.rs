// =============================================================================
// Exchange error taxonomy
// =============================================================================
//
// The adapter is the only layer that sees raw HTTP and venue error payloads;
// everything crossing the adapter boundary is one of these typed kinds. The
// engine branches on the kind, never on error strings:
//
//   Network / RateLimited / ClockSkew  — transient, retried inside the adapter
//   InsufficientFunds                  — fatal to the trade attempt, engine continues
//   OrderRejected / Api                — permanent order errors, surfaced
//   Unsupported                        — capability missing on this venue
//   Parse                              — malformed venue response
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("clock skew rejected by venue: {0}")]
    ClockSkew(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("operation not supported on this venue: {0}")]
    Unsupported(&'static str),

    #[error("venue api error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("malformed venue response: {0}")]
    Parse(String),
}

impl ExchangeError {
    /// Transient errors are worth retrying with backoff; everything else is
    /// surfaced to the caller immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited { .. } | Self::ClockSkew(_)
        )
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ExchangeError::Network("timeout".into()).is_transient());
        assert!(ExchangeError::RateLimited {
            retry_after_secs: Some(3)
        }
        .is_transient());
        assert!(ExchangeError::ClockSkew("-1021".into()).is_transient());

        assert!(!ExchangeError::InsufficientFunds("-2010".into()).is_transient());
        assert!(!ExchangeError::OrderRejected("bad price".into()).is_transient());
        assert!(!ExchangeError::Unsupported("funding").is_transient());
        assert!(!ExchangeError::Parse("not json".into()).is_transient());
    }
}
