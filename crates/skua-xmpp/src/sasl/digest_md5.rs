//! RFC 2831 DIGEST-MD5.
//!
//! The first challenge carries realm/nonce/qop; the reply is the digest
//! response computed against `xmpp/<server>`. The second challenge carries
//! only `rspauth`, which is verified against our own computation and
//! acknowledged with an empty response.

use std::collections::HashMap;

use md5::{Digest, Md5};
use rand::distr::Alphanumeric;
use rand::Rng;

use crate::error::ConnectionError;

use super::Mechanism;

pub struct DigestMd5 {
    username: String,
    password: String,
    digest_uri: String,
    /// Fixed in tests so the RFC reference vector is reproducible.
    cnonce: Option<String>,
    nonce_count: u32,
    expected_rspauth: Option<String>,
}

impl DigestMd5 {
    pub fn new(username: String, password: String, server: &str) -> Self {
        Self {
            username,
            password,
            digest_uri: format!("xmpp/{server}"),
            cnonce: None,
            nonce_count: 0,
            expected_rspauth: None,
        }
    }

    fn take_cnonce(&mut self) -> String {
        self.cnonce.take().unwrap_or_else(|| {
            rand::rng()
                .sample_iter(Alphanumeric)
                .take(30)
                .map(char::from)
                .collect()
        })
    }

    /// Both digests share A1; only A2 differs (`AUTHENTICATE:` prefix for
    /// the client response, bare for the server's rspauth).
    fn compute(
        &self,
        realm: &str,
        nonce: &str,
        cnonce: &str,
        nc: &str,
        qop: &str,
    ) -> (String, String) {
        let mut inner = Md5::new();
        inner.update(format!("{}:{realm}:{}", self.username, self.password));
        let mut a1 = inner.finalize().to_vec();
        a1.extend_from_slice(format!(":{nonce}:{cnonce}").as_bytes());
        let ha1 = hex::encode(Md5::digest(&a1));

        let ha2 = hex::encode(Md5::digest(format!("AUTHENTICATE:{}", self.digest_uri)));
        let response = hex::encode(Md5::digest(format!(
            "{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2}"
        )));

        let ha2_rsp = hex::encode(Md5::digest(format!(":{}", self.digest_uri)));
        let rspauth = hex::encode(Md5::digest(format!(
            "{ha1}:{nonce}:{nc}:{cnonce}:{qop}:{ha2_rsp}"
        )));

        (response, rspauth)
    }
}

impl Mechanism for DigestMd5 {
    fn name(&self) -> &'static str {
        "DIGEST-MD5"
    }

    fn initial(&mut self) -> Result<Vec<u8>, ConnectionError> {
        // The server speaks first.
        Ok(Vec::new())
    }

    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let text = std::str::from_utf8(challenge).map_err(|_| {
            ConnectionError::AuthenticationFailed("DIGEST-MD5 challenge is not UTF-8".to_string())
        })?;
        let pairs = parse_challenge(text);

        if let Some(rspauth) = pairs.get("rspauth") {
            match &self.expected_rspauth {
                Some(expected) if expected == rspauth => return Ok(Vec::new()),
                Some(_) => {
                    return Err(ConnectionError::AuthenticationFailed(
                        "server rspauth mismatch".to_string(),
                    ));
                }
                None => {
                    return Err(ConnectionError::AuthenticationFailed(
                        "unexpected rspauth before the digest response".to_string(),
                    ));
                }
            }
        }

        let nonce = pairs.get("nonce").ok_or_else(|| {
            ConnectionError::AuthenticationFailed("challenge missing nonce".to_string())
        })?;
        let realm = pairs.get("realm").map(String::as_str).unwrap_or("");
        let qop = pairs.get("qop").map(String::as_str).unwrap_or("auth");
        if !qop.split(',').any(|q| q.trim() == "auth") {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "unsupported qop '{qop}'"
            )));
        }
        let qop = "auth";

        let cnonce = self.take_cnonce();
        self.nonce_count += 1;
        let nc = format!("{:08}", self.nonce_count);

        let (response, rspauth) = self.compute(realm, nonce, &cnonce, &nc, qop);
        self.expected_rspauth = Some(rspauth);

        let mut reply = format!(
            "username=\"{}\",realm=\"{realm}\",nonce=\"{nonce}\",cnonce=\"{cnonce}\",\
             nc={nc},qop={qop},digest-uri=\"{}\",response={response},charset=utf-8",
            self.username, self.digest_uri
        );
        if realm.is_empty() {
            reply = reply.replace("realm=\"\",", "");
        }
        Ok(reply.into_bytes())
    }

    fn success(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        // Some servers skip the second challenge and put rspauth here.
        if data.is_empty() {
            return Ok(());
        }
        let text = std::str::from_utf8(data).unwrap_or_default();
        let pairs = parse_challenge(text);
        match (pairs.get("rspauth"), &self.expected_rspauth) {
            (Some(rspauth), Some(expected)) if rspauth == expected => Ok(()),
            (Some(_), _) => Err(ConnectionError::AuthenticationFailed(
                "server rspauth mismatch".to_string(),
            )),
            (None, _) => Ok(()),
        }
    }
}

/// Parse a comma-separated list of `key=value` pairs where values are
/// either bare tokens or quoted strings (quotes may contain commas).
fn parse_challenge(text: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            match stripped.find('"') {
                Some(end) => {
                    value = stripped[..end].to_string();
                    rest = stripped[end + 1..].trim_start_matches(',').trim_start();
                }
                None => {
                    value = stripped.to_string();
                    rest = "";
                }
            }
        } else {
            match rest.find(',') {
                Some(end) => {
                    value = rest[..end].trim().to_string();
                    rest = rest[end + 1..].trim_start();
                }
                None => {
                    value = rest.trim().to_string();
                    rest = "";
                }
            }
        }

        pairs.insert(key, value);
    }

    pairs
}
