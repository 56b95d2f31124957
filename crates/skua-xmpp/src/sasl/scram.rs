//! RFC 5802 SCRAM-SHA-1 without channel binding (`n,,` GS2 header).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distr::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::error::ConnectionError;

use super::Mechanism;

type HmacSha1 = Hmac<Sha1>;

pub struct ScramSha1 {
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: Option<String>,
    server_signature: Option<Vec<u8>>,
}

impl ScramSha1 {
    pub fn new(username: String, password: String) -> Self {
        let client_nonce = rand::rng()
            .sample_iter(Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(username, password, client_nonce)
    }

    /// Deterministic construction for the RFC 5802 known-answer tests.
    pub fn with_nonce(username: String, password: String, client_nonce: String) -> Self {
        Self {
            username,
            password,
            client_nonce,
            client_first_bare: None,
            server_signature: None,
        }
    }
}

impl Mechanism for ScramSha1 {
    fn name(&self) -> &'static str {
        "SCRAM-SHA-1"
    }

    fn initial(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let bare = format!("n={},r={}", escape_username(&self.username), self.client_nonce);
        let message = format!("n,,{bare}");
        self.client_first_bare = Some(bare);
        Ok(message.into_bytes())
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let server_first = std::str::from_utf8(challenge).map_err(|_| {
            ConnectionError::AuthenticationFailed("SCRAM challenge is not UTF-8".to_string())
        })?;

        // A final challenge may carry only the server signature.
        if let Some(signature) = parse_field(server_first, 'v') {
            self.verify_signature(&signature)?;
            return Ok(Vec::new());
        }

        let client_first_bare = self.client_first_bare.clone().ok_or_else(|| {
            ConnectionError::AuthenticationFailed(
                "challenge received before the initial message".to_string(),
            )
        })?;

        let server_nonce = parse_field(server_first, 'r').ok_or_else(|| {
            ConnectionError::AuthenticationFailed("server-first missing nonce".to_string())
        })?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(ConnectionError::AuthenticationFailed(
                "server nonce does not extend the client nonce".to_string(),
            ));
        }

        let salt = parse_field(server_first, 's')
            .and_then(|s| BASE64.decode(s).ok())
            .ok_or_else(|| {
                ConnectionError::AuthenticationFailed("server-first missing salt".to_string())
            })?;
        let iterations: u32 = parse_field(server_first, 'i')
            .and_then(|i| i.parse().ok())
            .ok_or_else(|| {
                ConnectionError::AuthenticationFailed(
                    "server-first missing iteration count".to_string(),
                )
            })?;

        let salted = hi(self.password.as_bytes(), &salt, iterations)?;
        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key = Sha1::digest(&client_key).to_vec();

        let without_proof = format!("c=biws,r={server_nonce}");
        let auth_message =
            format!("{client_first_bare},{server_first},{without_proof}");

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted, b"Server Key")?;
        self.server_signature = Some(hmac(&server_key, auth_message.as_bytes())?);

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)).into_bytes())
    }

    fn success(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let text = std::str::from_utf8(data).unwrap_or_default();
        match parse_field(text, 'v') {
            Some(signature) => self.verify_signature(&signature),
            // Signature already checked if it arrived in a final challenge.
            None if self.server_signature.is_none() => Ok(()),
            None => Err(ConnectionError::AuthenticationFailed(
                "success carried no server signature".to_string(),
            )),
        }
    }
}

impl ScramSha1 {
    fn verify_signature(&mut self, signature_b64: &str) -> Result<(), ConnectionError> {
        let received = BASE64.decode(signature_b64).map_err(|err| {
            ConnectionError::AuthenticationFailed(format!("bad server signature: {err}"))
        })?;
        let expected = self.server_signature.take().ok_or_else(|| {
            ConnectionError::AuthenticationFailed(
                "server signature arrived before the proof was sent".to_string(),
            )
        })?;

        if received == expected {
            Ok(())
        } else {
            Err(ConnectionError::AuthenticationFailed(
                "server signature mismatch".to_string(),
            ))
        }
    }
}

/// The RFC 5802 `Hi` function: HMAC feedback loop seeded with salt || 0001,
/// remaining rounds XORed together.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, ConnectionError> {
    if iterations == 0 {
        return Err(ConnectionError::AuthenticationFailed(
            "iteration count must be positive".to_string(),
        ));
    }

    let mut mac = HmacSha1::new_from_slice(password)
        .map_err(|_| ConnectionError::AuthenticationFailed("invalid HMAC key".to_string()))?;
    mac.update(salt);
    mac.update(&[0, 0, 0, 1]);
    let mut u = mac.finalize().into_bytes().to_vec();
    let mut result = u.clone();

    for _ in 1..iterations {
        let mut mac = HmacSha1::new_from_slice(password)
            .map_err(|_| ConnectionError::AuthenticationFailed("invalid HMAC key".to_string()))?;
        mac.update(&u);
        u = mac.finalize().into_bytes().to_vec();
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }

    Ok(result)
}

fn hmac(key: &[u8], message: &[u8]) -> Result<Vec<u8>, ConnectionError> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|_| ConnectionError::AuthenticationFailed("invalid HMAC key".to_string()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Extract `<name>=value` from a comma-separated SCRAM message.
fn parse_field(message: &str, name: char) -> Option<String> {
    message.split(',').find_map(|part| {
        let mut chars = part.chars();
        if chars.next() == Some(name) && chars.next() == Some('=') {
            Some(part[2..].to_string())
        } else {
            None
        }
    })
}

/// `=` and `,` are reserved in saslname (RFC 5802 section 5.1).
fn escape_username(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}
