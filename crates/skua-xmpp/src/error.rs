use thiserror::Error;

/// Errors surfaced by the session engine.
///
/// The engine never panics across its public boundary; every fatal
/// condition ends up as one of these, delivered through a `Result` or a
/// `session.error.occurred` event.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("XML parse error: {0}")]
    XmlError(String),

    #[error("Invalid JID: {0}")]
    InvalidJid(String),

    #[error("BOSH inactivity budget exceeded ({elapsed_secs}s dead, budget {budget_secs}s)")]
    InactivityExceeded {
        elapsed_secs: u64,
        budget_secs: u64,
    },

    #[error("Session closed")]
    SessionClosed,
}

impl ConnectionError {
    /// Whether the condition is worth retrying at the transport level.
    ///
    /// Authentication and XML failures are deterministic and will fail
    /// again; everything network-shaped may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::AuthenticationFailed(_)
                | ConnectionError::XmlError(_)
                | ConnectionError::InvalidJid(_)
        )
    }
}
