use thiserror::Error;

/// Errors surfaced across the swap-server API boundary and the protocol layer.
///
/// Internal plumbing is free to use `anyhow::Result` and convert into this
/// type at the edge (swap creation, claim construction); this is the type
/// callers outside the crate actually match on.
#[derive(Debug, Error)]
pub enum Error {
    #[error("swap server unreachable: {0}")]
    SwapServerUnreachable(String),

    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    #[error("claim output would be below dust")]
    BelowDust,

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("too early to refund")]
    TooEarlyToRefund,

    #[error("api error: {0}")]
    Api(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Api(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
