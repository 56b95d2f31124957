//! Stream feature negotiation: SASL, resource bind, optional session,
//! roster, initial presence.
//!
//! A pure state machine in the same shape as the SASL session: the caller
//! feeds it server elements and executes the actions it returns. All I/O
//! and event publication happen in the session actor.

use std::collections::HashSet;

use jid::FullJid;
use minidom::Element;
use skua_core::{PresenceShow, RosterItem};
use tracing::{debug, warn};

use crate::error::ConnectionError;
use crate::ns;
use crate::roster;
use crate::sasl::{Credentials, SaslOutcome, SaslSession};

const BIND_REQUEST_ID: &str = "resource-bind";
const SESSION_REQUEST_ID: &str = "session-request";
const ROSTER_REQUEST_ID: &str = "roster-request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    StreamOpened,
    Authenticating,
    BindingResource,
    EstablishingSession,
    RequestingRoster,
    AwaitingSelfPresence,
    Ready,
}

#[derive(Debug)]
pub enum NegotiatorAction {
    Send(Element),
    /// SASL succeeded; the transport must restart the XML stream before
    /// anything else is sent.
    RestartStream,
    Authenticated {
        mechanism: String,
    },
    Bound(FullJid),
    RosterStart,
    RosterItem(RosterItem),
    RosterEnd,
    Ready,
}

/// Whether the negotiator claimed a stanza for itself.
pub enum Handled {
    /// The stanza was part of negotiation; do not route it further.
    Consumed(Vec<NegotiatorAction>),
    /// The stanza triggered actions but should still reach the
    /// application (the self-presence echo).
    Observed(Vec<NegotiatorAction>),
    NotMine,
}

#[derive(Debug, Clone)]
pub struct PresenceSpec {
    pub show: PresenceShow,
    pub status: Option<String>,
    pub priority: Option<i8>,
}

impl Default for PresenceSpec {
    fn default() -> Self {
        Self {
            show: PresenceShow::Available,
            status: None,
            priority: None,
        }
    }
}

#[derive(Clone)]
pub struct NegotiatorConfig {
    pub domain: String,
    pub credentials: Credentials,
    /// Desired resource; the server assigns one when absent.
    pub resource: Option<String>,
    pub request_roster: bool,
    pub send_presence: bool,
    pub presence: PresenceSpec,
}

pub struct StreamNegotiator {
    config: NegotiatorConfig,
    phase: NegotiationPhase,
    sasl: Option<SaslSession>,
    sasl_done: bool,
    session_required: bool,
    bound_jid: Option<FullJid>,
}

impl StreamNegotiator {
    pub fn new(config: NegotiatorConfig) -> Self {
        Self {
            config,
            phase: NegotiationPhase::StreamOpened,
            sasl: None,
            sasl_done: false,
            session_required: false,
            bound_jid: None,
        }
    }

    pub fn phase(&self) -> NegotiationPhase {
        self.phase
    }

    pub fn bound_jid(&self) -> Option<&FullJid> {
        self.bound_jid.as_ref()
    }

    /// Process a server element, returning the actions to execute.
    pub fn handle(&mut self, element: &Element) -> Result<Handled, ConnectionError> {
        if element.is("error", ns::STREAM) {
            let condition = element
                .children()
                .next()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "undefined-condition".to_string());
            return Err(ConnectionError::StreamError(format!(
                "stream error: {condition}"
            )));
        }

        if element.is("features", ns::STREAM) {
            return self.on_features(element).map(Handled::Consumed);
        }

        if element.ns() == ns::SASL {
            return self.on_sasl(element).map(Handled::Consumed);
        }

        if element.is("iq", ns::CLIENT) {
            return self.on_iq(element);
        }

        if element.is("presence", ns::CLIENT)
            && self.phase == NegotiationPhase::AwaitingSelfPresence
        {
            if let (Some(from), Some(own)) = (element.attr("from"), &self.bound_jid) {
                if from == own.to_string() {
                    debug!(jid = %own, "self-presence echo observed, session ready");
                    self.phase = NegotiationPhase::Ready;
                    return Ok(Handled::Observed(vec![NegotiatorAction::Ready]));
                }
            }
        }

        Ok(Handled::NotMine)
    }

    fn on_features(&mut self, features: &Element) -> Result<Vec<NegotiatorAction>, ConnectionError> {
        if !self.sasl_done {
            let mechanisms: HashSet<String> = features
                .get_child("mechanisms", ns::SASL)
                .map(|m| {
                    m.children()
                        .filter(|c| c.is("mechanism", ns::SASL))
                        .map(|c| c.text())
                        .collect()
                })
                .unwrap_or_default();

            if mechanisms.is_empty() {
                return Err(ConnectionError::StreamError(
                    "stream features advertised no SASL mechanisms".to_string(),
                ));
            }

            let (session, auth) =
                SaslSession::start(&self.config.credentials, &self.config.domain, &mechanisms)?;
            self.sasl = Some(session);
            self.phase = NegotiationPhase::Authenticating;
            return Ok(vec![NegotiatorAction::Send(auth)]);
        }

        // Post-restart features: record session, then bind.
        self.session_required = features.get_child("session", ns::SESSION).is_some();

        if features.get_child("bind", ns::BIND).is_none() {
            return Err(ConnectionError::StreamError(
                "server does not advertise resource binding".to_string(),
            ));
        }

        let mut bind = Element::bare("bind", ns::BIND);
        if let Some(resource) = &self.config.resource {
            let mut r = Element::bare("resource", ns::BIND);
            r.append_text_node(resource.clone());
            bind.append_child(r);
        }
        let iq = Element::builder("iq", ns::CLIENT)
            .attr("type", "set")
            .attr("id", BIND_REQUEST_ID)
            .append(bind)
            .build();

        self.phase = NegotiationPhase::BindingResource;
        Ok(vec![NegotiatorAction::Send(iq)])
    }

    fn on_sasl(&mut self, element: &Element) -> Result<Vec<NegotiatorAction>, ConnectionError> {
        let Some(sasl) = self.sasl.as_mut() else {
            return Err(ConnectionError::StreamError(format!(
                "SASL element <{}/> outside authentication",
                element.name()
            )));
        };

        match sasl.handle(element)? {
            SaslOutcome::Continue(response) => Ok(vec![NegotiatorAction::Send(response)]),
            SaslOutcome::Success => {
                let mechanism = sasl.mechanism_name().to_string();
                self.sasl = None;
                self.sasl_done = true;
                // The stream context restarts; features will arrive again.
                self.phase = NegotiationPhase::StreamOpened;
                Ok(vec![
                    NegotiatorAction::Authenticated { mechanism },
                    NegotiatorAction::RestartStream,
                ])
            }
            SaslOutcome::Failure(err) => {
                warn!(error = %err, "SASL negotiation failed");
                Err(err)
            }
        }
    }

    fn on_iq(&mut self, iq: &Element) -> Result<Handled, ConnectionError> {
        let iq_type = iq.attr("type").unwrap_or_default();
        let id = iq.attr("id").unwrap_or_default();

        // Roster pushes arrive at any phase once the session is bound.
        if iq_type == "set" {
            if let Some(query) = iq.get_child("query", ns::ROSTER) {
                let mut actions: Vec<NegotiatorAction> = parse_roster_actions(query);
                if let Some(ack) = roster::build_push_ack(iq) {
                    actions.push(NegotiatorAction::Send(ack));
                }
                return Ok(Handled::Consumed(actions));
            }
            return Ok(Handled::NotMine);
        }

        match id {
            BIND_REQUEST_ID => self.on_bind_reply(iq, iq_type).map(Handled::Consumed),
            SESSION_REQUEST_ID => {
                if iq_type != "result" {
                    return Err(ConnectionError::StreamError(
                        "session establishment failed".to_string(),
                    ));
                }
                let mut actions = Vec::new();
                self.after_session(&mut actions);
                Ok(Handled::Consumed(actions))
            }
            ROSTER_REQUEST_ID => {
                if iq_type != "result" {
                    return Err(ConnectionError::StreamError(
                        "roster request failed".to_string(),
                    ));
                }
                let mut actions = iq
                    .get_child("query", ns::ROSTER)
                    .map(parse_roster_actions)
                    .unwrap_or_else(|| {
                        vec![NegotiatorAction::RosterStart, NegotiatorAction::RosterEnd]
                    });
                self.presence_step(&mut actions);
                Ok(Handled::Consumed(actions))
            }
            _ => Ok(Handled::NotMine),
        }
    }

    fn on_bind_reply(
        &mut self,
        iq: &Element,
        iq_type: &str,
    ) -> Result<Vec<NegotiatorAction>, ConnectionError> {
        if iq_type != "result" {
            return Err(ConnectionError::StreamError(
                "resource binding failed".to_string(),
            ));
        }

        let jid_text = iq
            .get_child("bind", ns::BIND)
            .and_then(|bind| bind.get_child("jid", ns::BIND))
            .map(|jid| jid.text())
            .ok_or_else(|| {
                ConnectionError::StreamError("bind result carried no JID".to_string())
            })?;
        let jid: FullJid = jid_text
            .parse()
            .map_err(|_| ConnectionError::InvalidJid(jid_text.clone()))?;

        debug!(jid = %jid, "resource bound");
        self.bound_jid = Some(jid.clone());
        let mut actions = vec![NegotiatorAction::Bound(jid)];

        if self.session_required {
            let iq = Element::builder("iq", ns::CLIENT)
                .attr("type", "set")
                .attr("id", SESSION_REQUEST_ID)
                .append(Element::bare("session", ns::SESSION))
                .build();
            self.phase = NegotiationPhase::EstablishingSession;
            actions.push(NegotiatorAction::Send(iq));
        } else {
            self.after_session(&mut actions);
        }
        Ok(actions)
    }

    fn after_session(&mut self, actions: &mut Vec<NegotiatorAction>) {
        if self.config.request_roster {
            self.phase = NegotiationPhase::RequestingRoster;
            actions.push(NegotiatorAction::Send(roster::build_roster_get(
                ROSTER_REQUEST_ID,
            )));
        } else {
            self.presence_step(actions);
        }
    }

    fn presence_step(&mut self, actions: &mut Vec<NegotiatorAction>) {
        if !self.config.send_presence {
            // Without initial presence there is no echo to wait for.
            self.phase = NegotiationPhase::Ready;
            actions.push(NegotiatorAction::Ready);
            return;
        }

        let spec = &self.config.presence;
        let mut presence = Element::bare("presence", ns::CLIENT);
        if let Some(show) = spec.show.as_show_text() {
            let mut child = Element::bare("show", ns::CLIENT);
            child.append_text_node(show);
            presence.append_child(child);
        }
        if let Some(status) = &spec.status {
            let mut child = Element::bare("status", ns::CLIENT);
            child.append_text_node(status.clone());
            presence.append_child(child);
        }
        if let Some(priority) = spec.priority {
            let mut child = Element::bare("priority", ns::CLIENT);
            child.append_text_node(priority.to_string());
            presence.append_child(child);
        }

        self.phase = NegotiationPhase::AwaitingSelfPresence;
        actions.push(NegotiatorAction::Send(presence));
    }
}

fn parse_roster_actions(query: &Element) -> Vec<NegotiatorAction> {
    let mut actions = vec![NegotiatorAction::RosterStart];
    actions.extend(
        roster::parse_roster_items(query)
            .into_iter()
            .map(NegotiatorAction::RosterItem),
    );
    actions.push(NegotiatorAction::RosterEnd);
    actions
}
