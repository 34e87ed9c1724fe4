use thiserror::Error;

/// Failures talking to the broker REST API
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker credentials are not configured")]
    MissingCredentials,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited by broker after {0} attempts")]
    RateLimited(u32),

    #[error("broker returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("unexpected broker response: {0}")]
    Api(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl BrokerError {
    /// Status code for HTTP-level failures
    pub fn status(&self) -> Option<u16> {
        match self {
            BrokerError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
