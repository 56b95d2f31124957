//! SASL authentication: mechanism selection and the challenge-response
//! state machine.
//!
//! The four mechanisms are implemented in-repo because the handshake math
//! is verified against the RFC reference vectors, which requires injecting
//! fixed nonces.

mod anonymous;
mod digest_md5;
mod plain;
mod scram;

use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use minidom::Element;
use tracing::debug;

use crate::error::ConnectionError;
use crate::ns;

pub use anonymous::Anonymous;
pub use digest_md5::DigestMd5;
pub use plain::Plain;
pub use scram::ScramSha1;

/// One SASL mechanism's view of the handshake. `initial()` produces the
/// payload for `<auth/>`, `response()` answers a `<challenge/>`, and
/// `success()` verifies any additional data carried on `<success/>`.
pub trait Mechanism: Send + Sync {
    fn name(&self) -> &'static str;
    fn initial(&mut self) -> Result<Vec<u8>, ConnectionError>;
    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>, ConnectionError>;
    fn success(&mut self, data: &[u8]) -> Result<(), ConnectionError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha1,
    DigestMd5,
    Plain,
    Anonymous,
}

impl SelectedMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::DigestMd5 => "DIGEST-MD5",
            SelectedMechanism::Plain => "PLAIN",
            SelectedMechanism::Anonymous => "ANONYMOUS",
        }
    }
}

impl std::fmt::Display for SelectedMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const MECHANISM_PREFERENCE: &[SelectedMechanism] = &[
    SelectedMechanism::ScramSha1,
    SelectedMechanism::DigestMd5,
    SelectedMechanism::Plain,
    SelectedMechanism::Anonymous,
];

/// Pick the strongest mechanism both sides support. No match is fatal;
/// there is no fallback chain after a failed attempt.
pub fn select_mechanism(server_mechanisms: &HashSet<String>) -> Option<SelectedMechanism> {
    MECHANISM_PREFERENCE
        .iter()
        .find(|m| server_mechanisms.contains(m.name()))
        .copied()
}

fn build_mechanism(
    selected: SelectedMechanism,
    credentials: &Credentials,
    server: &str,
) -> Box<dyn Mechanism> {
    match selected {
        SelectedMechanism::ScramSha1 => Box::new(ScramSha1::new(
            credentials.username.clone(),
            credentials.password.clone(),
        )),
        SelectedMechanism::DigestMd5 => Box::new(DigestMd5::new(
            credentials.username.clone(),
            credentials.password.clone(),
            server,
        )),
        SelectedMechanism::Plain => Box::new(Plain::new(
            credentials.username.clone(),
            credentials.password.clone(),
        )),
        SelectedMechanism::Anonymous => Box::new(Anonymous::new()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslState {
    AwaitingChallenge,
    AwaitingFinalChallenge,
    Succeeded,
    Failed,
}

/// What the negotiator should do with the server's last SASL element.
pub enum SaslOutcome {
    /// Send this `<response/>` and keep waiting.
    Continue(Element),
    /// Authentication succeeded; the caller must restart the XML stream.
    Success,
    /// Authentication failed; no automatic retry.
    Failure(ConnectionError),
}

pub struct SaslSession {
    mechanism: Box<dyn Mechanism>,
    state: SaslState,
}

impl SaslSession {
    /// Select a mechanism and produce the opening `<auth/>` element.
    pub fn start(
        credentials: &Credentials,
        server: &str,
        server_mechanisms: &HashSet<String>,
    ) -> Result<(Self, Element), ConnectionError> {
        let selected = select_mechanism(server_mechanisms).ok_or_else(|| {
            ConnectionError::AuthenticationFailed(format!(
                "no supported mechanism among {server_mechanisms:?}"
            ))
        })?;
        debug!(mechanism = %selected, "starting SASL negotiation");

        let mut mechanism = build_mechanism(selected, credentials, server);
        let initial = mechanism.initial()?;

        let mut auth = Element::builder("auth", ns::SASL)
            .attr("mechanism", selected.name())
            .build();
        if !initial.is_empty() {
            auth.append_text_node(BASE64.encode(&initial));
        }

        Ok((
            Self {
                mechanism,
                state: SaslState::AwaitingChallenge,
            },
            auth,
        ))
    }

    pub fn state(&self) -> SaslState {
        self.state
    }

    pub fn mechanism_name(&self) -> &'static str {
        self.mechanism.name()
    }

    /// Drive the handshake with a server-sent SASL element.
    pub fn handle(&mut self, element: &Element) -> Result<SaslOutcome, ConnectionError> {
        if element.is("challenge", ns::SASL) {
            let challenge = decode_payload(&element.text())?;
            let payload = match self.mechanism.response(&challenge) {
                Ok(payload) => payload,
                Err(err) => {
                    self.state = SaslState::Failed;
                    return Err(err);
                }
            };

            self.state = SaslState::AwaitingFinalChallenge;
            let mut response = Element::bare("response", ns::SASL);
            if !payload.is_empty() {
                response.append_text_node(BASE64.encode(&payload));
            }
            return Ok(SaslOutcome::Continue(response));
        }

        if element.is("success", ns::SASL) {
            let data = decode_payload(&element.text())?;
            match self.mechanism.success(&data) {
                Ok(()) => {
                    self.state = SaslState::Succeeded;
                    debug!(mechanism = self.mechanism.name(), "SASL succeeded");
                    Ok(SaslOutcome::Success)
                }
                Err(err) => {
                    self.state = SaslState::Failed;
                    Err(err)
                }
            }
        } else if element.is("failure", ns::SASL) {
            self.state = SaslState::Failed;
            Ok(SaslOutcome::Failure(map_failure(element)))
        } else {
            Err(ConnectionError::StreamError(format!(
                "unexpected element <{}/> during SASL negotiation",
                element.name()
            )))
        }
    }
}

fn decode_payload(text: &str) -> Result<Vec<u8>, ConnectionError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(trimmed)
        .map_err(|err| ConnectionError::AuthenticationFailed(format!("invalid base64: {err}")))
}

fn map_failure(failure: &Element) -> ConnectionError {
    let condition = failure
        .children()
        .find(|child| child.name() != "text")
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "unknown-condition".to_string());
    let text = failure
        .get_child("text", ns::SASL)
        .map(|t| t.text())
        .unwrap_or_default();

    if text.is_empty() {
        ConnectionError::AuthenticationFailed(condition)
    } else {
        ConnectionError::AuthenticationFailed(format!("{condition}: {text}"))
    }
}
