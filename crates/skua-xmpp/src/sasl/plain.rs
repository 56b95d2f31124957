use crate::error::ConnectionError;

use super::Mechanism;

/// RFC 4616 PLAIN: a single `\0user\0password` payload, no challenges.
pub struct Plain {
    username: String,
    password: String,
}

impl Plain {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

impl Mechanism for Plain {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn initial(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let mut payload = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        payload.push(0);
        payload.extend_from_slice(self.username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.password.as_bytes());
        Ok(payload)
    }

    fn response(&mut self, _challenge: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        Err(ConnectionError::AuthenticationFailed(
            "PLAIN received an unexpected challenge".to_string(),
        ))
    }

    fn success(&mut self, _data: &[u8]) -> Result<(), ConnectionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_is_nul_separated() {
        let mut plain = Plain::new("user".into(), "pass".into());
        assert_eq!(plain.initial().expect("initial"), b"\0user\0pass");
    }

    #[test]
    fn challenge_is_rejected() {
        let mut plain = Plain::new("user".into(), "pass".into());
        assert!(plain.response(b"anything").is_err());
    }
}
