use crate::error::ConnectionError;

use super::Mechanism;

/// RFC 4505 ANONYMOUS: a bare `<auth/>`, no payload, no challenges.
pub struct Anonymous;

impl Anonymous {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Anonymous {
    fn default() -> Self {
        Self::new()
    }
}

impl Mechanism for Anonymous {
    fn name(&self) -> &'static str {
        "ANONYMOUS"
    }

    fn initial(&mut self) -> Result<Vec<u8>, ConnectionError> {
        Ok(Vec::new())
    }

    fn response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        Err(ConnectionError::AuthenticationFailed(
            "ANONYMOUS received an unexpected challenge".to_string(),
        ))
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), ConnectionError> {
        Ok(())
    }
}
