//! The session controller: one actor owning the negotiator, the IQ
//! correlator and the transport link.
//!
//! All stream state lives inside the actor task; the `Session` handle is
//! a cheap clone holding a command channel and the event bus. Application
//! code observes the session through bus subscriptions and drives it
//! through `send`/`send_iq`/`disconnect`.

use minidom::Element;
use skua_core::{
    BroadcastEventBus, Channel, Event, EventBus, EventBusError, EventPayload, EventSource,
    EventSubscription,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::correlator::IqCorrelator;
use crate::error::ConnectionError;
use crate::negotiator::{
    Handled, NegotiatorAction, NegotiatorConfig, PresenceSpec, StreamNegotiator,
};
use crate::ns;
use crate::sasl::Credentials;
use crate::transport::{self, TransportCommand, TransportConfig, TransportEvent, TransportLink};

#[derive(Clone)]
pub struct SessionConfig {
    /// Local part of the account JID. Empty for ANONYMOUS login.
    pub username: String,
    pub password: String,
    pub domain: String,
    pub transport: TransportConfig,
    /// Desired resource; the server assigns one when absent.
    pub resource: Option<String>,
    pub request_roster: bool,
    pub send_initial_presence: bool,
    pub presence: PresenceSpec,
}

enum SessionCommand {
    Send(Element),
    SendIq {
        stanza: Element,
        reply: oneshot::Sender<Element>,
    },
    Close,
}

/// Handle to a running session actor.
#[derive(Clone)]
pub struct Session {
    commands: mpsc::Sender<SessionCommand>,
    bus: BroadcastEventBus,
}

impl Session {
    /// Connect the configured transport and start the session actor. BOSH
    /// session creation happens inline, so endpoint failures surface here.
    pub async fn connect(config: SessionConfig) -> Result<Self, ConnectionError> {
        let link = transport::connect(&config.transport, &config.domain).await?;
        Ok(Self::spawn(config, link))
    }

    fn spawn(config: SessionConfig, link: TransportLink) -> Self {
        let bus = BroadcastEventBus::new(BroadcastEventBus::DEFAULT_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::channel(64);

        let bare_jid = if config.username.is_empty() {
            config.domain.clone()
        } else {
            format!("{}@{}", config.username, config.domain)
        };
        let negotiator = StreamNegotiator::new(NegotiatorConfig {
            domain: config.domain.clone(),
            credentials: Credentials {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            resource: config.resource.clone(),
            request_roster: config.request_roster,
            send_presence: config.send_initial_presence,
            presence: config.presence.clone(),
        });

        let actor = SessionActor {
            negotiator,
            correlator: IqCorrelator::new(),
            link,
            bus: bus.clone(),
            bare_jid,
            established: false,
        };
        tokio::spawn(actor.run(command_rx));

        Self {
            commands: command_tx,
            bus,
        }
    }

    /// Subscribe to bus events matching a glob pattern, e.g. `stanza.*`.
    pub fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        self.bus.subscribe(pattern)
    }

    /// Queue a stanza for sending.
    pub async fn send(&self, stanza: Element) -> Result<(), ConnectionError> {
        self.commands
            .send(SessionCommand::Send(stanza))
            .await
            .map_err(|_| ConnectionError::SessionClosed)
    }

    /// Send an IQ request and await its `result` or `error` reply. There
    /// is no timeout; an unanswered request resolves with `SessionClosed`
    /// when the session ends.
    pub async fn send_iq(&self, stanza: Element) -> Result<Element, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::SendIq { stanza, reply: tx })
            .await
            .map_err(|_| ConnectionError::SessionClosed)?;
        rx.await.map_err(|_| ConnectionError::SessionClosed)
    }

    /// Ask the transport to terminate cleanly. The `session.connection.lost`
    /// event confirms completion.
    pub async fn disconnect(&self) {
        let _ = self.commands.send(SessionCommand::Close).await;
    }
}

struct SessionActor {
    negotiator: StreamNegotiator,
    correlator: IqCorrelator,
    link: TransportLink,
    bus: BroadcastEventBus,
    bare_jid: String,
    established: bool,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(SessionCommand::Send(stanza)) => {
                        if self.send_stanza(stanza).await.is_err() {
                            break;
                        }
                    }
                    Some(SessionCommand::SendIq { mut stanza, reply }) => {
                        let id = IqCorrelator::ensure_id(&mut stanza);
                        self.correlator.register_sender(id, reply);
                        if self.send_stanza(stanza).await.is_err() {
                            break;
                        }
                    }
                    Some(SessionCommand::Close) => {
                        let _ = self.link.commands.send(TransportCommand::Close).await;
                    }
                    // Every handle dropped; close the stream.
                    None => {
                        commands_open = false;
                        let _ = self.link.commands.send(TransportCommand::Close).await;
                    }
                },
                event = self.link.events.recv() => match event {
                    Some(TransportEvent::StreamStart { attrs }) => {
                        debug!(?attrs, "stream opened");
                        if !self.established {
                            self.established = true;
                            self.publish(
                                "session.connection.established",
                                EventPayload::ConnectionEstablished {
                                    jid: self.bare_jid.clone(),
                                },
                            );
                        }
                    }
                    Some(TransportEvent::Stanza(stanza)) => {
                        if let Err(err) = self.on_stanza(stanza).await {
                            warn!(error = %err, "session error");
                            self.publish(
                                "session.error.occurred",
                                EventPayload::ErrorOccurred {
                                    component: "session".to_string(),
                                    message: err.to_string(),
                                    recoverable: err.is_retryable(),
                                },
                            );
                            let _ = self.link.commands.send(TransportCommand::Close).await;
                        }
                    }
                    Some(TransportEvent::StreamEnd) => {
                        debug!("stream closed by server");
                    }
                    Some(TransportEvent::Disconnected { reason, error }) => {
                        let will_retry = error.map(|e| e.is_retryable()).unwrap_or(false);
                        self.publish(
                            "session.connection.lost",
                            EventPayload::ConnectionLost { reason, will_retry },
                        );
                        break;
                    }
                    None => {
                        self.publish(
                            "session.connection.lost",
                            EventPayload::ConnectionLost {
                                reason: "transport task ended".to_string(),
                                will_retry: false,
                            },
                        );
                        break;
                    }
                }
            }
        }
        // Pending IQ callers observe a closed channel.
        self.correlator.close();
    }

    async fn on_stanza(&mut self, stanza: Element) -> Result<(), ConnectionError> {
        self.publish(
            "stanza.raw.received",
            EventPayload::RawStanzaReceived {
                stanza: String::from(&stanza),
            },
        );
        if stanza.is("features", ns::STREAM) {
            self.publish(
                "stream.features.received",
                EventPayload::StreamFeaturesReceived {
                    features: String::from(&stanza),
                },
            );
        }

        let (actions, route_onward) = match self.negotiator.handle(&stanza)? {
            Handled::Consumed(actions) => (actions, false),
            Handled::Observed(actions) => (actions, true),
            Handled::NotMine => (Vec::new(), true),
        };
        for action in actions {
            self.apply(action).await?;
        }

        if route_onward {
            // A consumed correlation reply never reaches the generic
            // stanza channels.
            if self.correlator.complete(&stanza) {
                return Ok(());
            }
            self.route(&stanza);
        }
        Ok(())
    }

    async fn apply(&mut self, action: NegotiatorAction) -> Result<(), ConnectionError> {
        match action {
            NegotiatorAction::Send(stanza) => self.send_stanza(stanza).await?,
            NegotiatorAction::RestartStream => {
                self.link
                    .commands
                    .send(TransportCommand::Restart)
                    .await
                    .map_err(|_| ConnectionError::SessionClosed)?;
            }
            NegotiatorAction::Authenticated { mechanism } => {
                self.publish(
                    "stream.authenticated",
                    EventPayload::Authenticated { mechanism },
                );
            }
            NegotiatorAction::Bound(jid) => {
                self.publish(
                    "stream.bound",
                    EventPayload::Bound {
                        jid: jid.to_string(),
                    },
                );
            }
            NegotiatorAction::RosterStart => {
                self.publish("roster.start", EventPayload::RosterStart);
            }
            NegotiatorAction::RosterItem(item) => {
                self.publish("roster.item", EventPayload::RosterItem { item });
            }
            NegotiatorAction::RosterEnd => {
                self.publish("roster.end", EventPayload::RosterEnd);
            }
            NegotiatorAction::Ready => {
                let jid = self
                    .negotiator
                    .bound_jid()
                    .map(|j| j.to_string())
                    .unwrap_or_else(|| self.bare_jid.clone());
                self.publish("session.ready", EventPayload::SessionReady { jid });
            }
        }
        Ok(())
    }

    async fn send_stanza(&self, stanza: Element) -> Result<(), ConnectionError> {
        self.publish(
            "stanza.raw.sent",
            EventPayload::RawStanzaSent {
                stanza: String::from(&stanza),
            },
        );
        self.link
            .commands
            .send(TransportCommand::Send(stanza))
            .await
            .map_err(|_| ConnectionError::SessionClosed)
    }

    fn route(&self, stanza: &Element) {
        let text = String::from(stanza);
        let (channel, payload) = match stanza.name() {
            "message" => (
                "stanza.message.received",
                EventPayload::MessageReceived { stanza: text },
            ),
            "presence" => (
                "stanza.presence.received",
                EventPayload::PresenceReceived { stanza: text },
            ),
            "iq" => ("stanza.iq.received", EventPayload::IqReceived { stanza: text }),
            other => {
                debug!(name = other, "ignoring unrouted element");
                return;
            }
        };
        self.publish(channel, payload);
    }

    fn publish(&self, channel: &str, payload: EventPayload) {
        match Channel::new(channel) {
            Ok(channel) => {
                if let Err(err) = self
                    .bus
                    .publish(Event::new(channel, EventSource::Session, payload))
                {
                    debug!(error = %err, "event not delivered");
                }
            }
            Err(err) => warn!(error = %err, "invalid event channel"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::bosh::BoshConfig;

    fn config() -> SessionConfig {
        SessionConfig {
            username: "alice".into(),
            password: "hunter2".into(),
            domain: "example.com".into(),
            transport: TransportConfig::Bosh(BoshConfig::new("https://example.com/http-bind")),
            resource: Some("orc".into()),
            request_roster: true,
            send_initial_presence: true,
            presence: PresenceSpec::default(),
        }
    }

    struct FakeTransport {
        commands: mpsc::Receiver<TransportCommand>,
        events: mpsc::Sender<TransportEvent>,
    }

    fn fake_session(cfg: SessionConfig) -> (Session, FakeTransport) {
        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let session = Session::spawn(
            cfg,
            TransportLink {
                commands: command_tx,
                events: event_rx,
            },
        );
        (
            session,
            FakeTransport {
                commands: command_rx,
                events: event_tx,
            },
        )
    }

    async fn next_command(transport: &mut FakeTransport) -> TransportCommand {
        tokio::time::timeout(Duration::from_secs(2), transport.commands.recv())
            .await
            .expect("no timeout")
            .expect("command issued")
    }

    async fn next_sent(transport: &mut FakeTransport) -> Element {
        match next_command(transport).await {
            TransportCommand::Send(el) => el,
            other => panic!("expected Send, got {other:?}"),
        }
    }

    async fn next_event(subscription: &mut EventSubscription) -> Event {
        tokio::time::timeout(Duration::from_secs(2), subscription.recv())
            .await
            .expect("no timeout")
            .expect("event delivered")
    }

    async fn feed(transport: &FakeTransport, xml: &str) {
        let stanza: Element = xml.parse().expect("valid stanza");
        transport
            .events
            .send(TransportEvent::Stanza(stanza))
            .await
            .expect("actor alive");
    }

    #[tokio::test]
    async fn full_negotiation_reaches_ready() {
        let (session, mut transport) = fake_session(config());
        let mut session_events = session.subscribe("session.*").expect("subscribed");
        let mut stream_events = session.subscribe("stream.*").expect("subscribed");
        let mut roster_events = session.subscribe("roster.*").expect("subscribed");

        transport
            .events
            .send(TransportEvent::StreamStart { attrs: vec![] })
            .await
            .expect("actor alive");
        match next_event(&mut session_events).await.payload {
            EventPayload::ConnectionEstablished { jid } => {
                assert_eq!(jid, "alice@example.com");
            }
            other => panic!("expected ConnectionEstablished, got {other:?}"),
        }

        feed(
            &transport,
            "<features xmlns='http://etherx.jabber.org/streams'>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism></mechanisms></features>",
        )
        .await;
        let auth = next_sent(&mut transport).await;
        assert!(auth.is("auth", ns::SASL));

        feed(&transport, "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await;
        assert!(matches!(
            next_command(&mut transport).await,
            TransportCommand::Restart
        ));
        match next_event(&mut stream_events).await.payload {
            EventPayload::StreamFeaturesReceived { .. } => {}
            other => panic!("expected StreamFeaturesReceived, got {other:?}"),
        }
        match next_event(&mut stream_events).await.payload {
            EventPayload::Authenticated { mechanism } => assert_eq!(mechanism, "PLAIN"),
            other => panic!("expected Authenticated, got {other:?}"),
        }

        transport
            .events
            .send(TransportEvent::StreamStart { attrs: vec![] })
            .await
            .expect("actor alive");
        feed(
            &transport,
            "<features xmlns='http://etherx.jabber.org/streams'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></features>",
        )
        .await;
        let bind = next_sent(&mut transport).await;
        assert_eq!(bind.attr("id"), Some("resource-bind"));

        feed(
            &transport,
            "<iq xmlns='jabber:client' type='result' id='resource-bind'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>alice@example.com/orc</jid></bind></iq>",
        )
        .await;
        let roster_get = next_sent(&mut transport).await;
        assert_eq!(roster_get.attr("id"), Some("roster-request"));
        // Skip the second features event before checking Bound.
        next_event(&mut stream_events).await;
        match next_event(&mut stream_events).await.payload {
            EventPayload::Bound { jid } => assert_eq!(jid, "alice@example.com/orc"),
            other => panic!("expected Bound, got {other:?}"),
        }

        feed(
            &transport,
            "<iq xmlns='jabber:client' type='result' id='roster-request'>\
             <query xmlns='jabber:iq:roster'>\
             <item jid='bob@example.com' subscription='both'/></query></iq>",
        )
        .await;
        let presence = next_sent(&mut transport).await;
        assert!(presence.is("presence", ns::CLIENT));

        assert!(matches!(
            next_event(&mut roster_events).await.payload,
            EventPayload::RosterStart
        ));
        match next_event(&mut roster_events).await.payload {
            EventPayload::RosterItem { item } => assert_eq!(item.jid, "bob@example.com"),
            other => panic!("expected RosterItem, got {other:?}"),
        }
        assert!(matches!(
            next_event(&mut roster_events).await.payload,
            EventPayload::RosterEnd
        ));

        feed(
            &transport,
            "<presence xmlns='jabber:client' from='alice@example.com/orc'/>",
        )
        .await;
        match next_event(&mut session_events).await.payload {
            EventPayload::SessionReady { jid } => assert_eq!(jid, "alice@example.com/orc"),
            other => panic!("expected SessionReady, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn self_presence_echo_still_reaches_subscribers() {
        let (session, mut transport) = fake_session(config());
        let mut stanza_events = session.subscribe("stanza.presence.*").expect("subscribed");

        // Fast-forward to awaiting the echo.
        transport
            .events
            .send(TransportEvent::StreamStart { attrs: vec![] })
            .await
            .expect("actor alive");
        feed(
            &transport,
            "<features xmlns='http://etherx.jabber.org/streams'>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism></mechanisms></features>",
        )
        .await;
        next_sent(&mut transport).await;
        feed(&transport, "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await;
        next_command(&mut transport).await;
        feed(
            &transport,
            "<features xmlns='http://etherx.jabber.org/streams'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></features>",
        )
        .await;
        next_sent(&mut transport).await;
        feed(
            &transport,
            "<iq xmlns='jabber:client' type='result' id='resource-bind'>\
             <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
             <jid>alice@example.com/orc</jid></bind></iq>",
        )
        .await;
        next_sent(&mut transport).await;
        feed(
            &transport,
            "<iq xmlns='jabber:client' type='result' id='roster-request'>\
             <query xmlns='jabber:iq:roster'/></iq>",
        )
        .await;
        next_sent(&mut transport).await;

        feed(
            &transport,
            "<presence xmlns='jabber:client' from='alice@example.com/orc'/>",
        )
        .await;
        match next_event(&mut stanza_events).await.payload {
            EventPayload::PresenceReceived { stanza } => {
                assert!(stanza.contains("alice@example.com/orc"));
            }
            other => panic!("expected PresenceReceived, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_iq_resolves_with_matching_reply() {
        let (session, mut transport) = fake_session(config());

        let request: Element = "<iq xmlns='jabber:client' type='get'>\
             <query xmlns='jabber:iq:roster'/></iq>"
            .parse()
            .expect("valid iq");
        let session2 = session.clone();
        let pending = tokio::spawn(async move { session2.send_iq(request).await });

        let sent = next_sent(&mut transport).await;
        let id = sent.attr("id").expect("id assigned").to_string();

        feed(
            &transport,
            &format!("<iq xmlns='jabber:client' type='result' id='{id}'/>"),
        )
        .await;

        let reply = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("no timeout")
            .expect("task finished")
            .expect("reply delivered");
        assert_eq!(reply.attr("id"), Some(id.as_str()));
    }

    #[tokio::test]
    async fn correlated_reply_skips_generic_iq_channel() {
        let (session, mut transport) = fake_session(config());
        let mut iq_events = session.subscribe("stanza.iq.*").expect("subscribed");

        let request: Element = "<iq xmlns='jabber:client' type='get' id='probe1'/>"
            .parse()
            .expect("valid iq");
        let session2 = session.clone();
        let pending = tokio::spawn(async move { session2.send_iq(request).await });
        next_sent(&mut transport).await;

        feed(&transport, "<iq xmlns='jabber:client' type='result' id='probe1'/>").await;
        pending
            .await
            .expect("task finished")
            .expect("reply delivered");

        // An unrelated inbound iq still reaches the channel.
        feed(
            &transport,
            "<iq xmlns='jabber:client' type='get' id='srv1' from='example.com'/>",
        )
        .await;
        match next_event(&mut iq_events).await.payload {
            EventPayload::IqReceived { stanza } => assert!(stanza.contains("srv1")),
            other => panic!("expected IqReceived, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_drops_pending_iqs_and_reports_loss() {
        let (session, mut transport) = fake_session(config());
        let mut session_events = session.subscribe("session.*").expect("subscribed");

        let request: Element = "<iq xmlns='jabber:client' type='get' id='never'/>"
            .parse()
            .expect("valid iq");
        let session2 = session.clone();
        let pending = tokio::spawn(async move { session2.send_iq(request).await });
        next_sent(&mut transport).await;

        session.disconnect().await;
        assert!(matches!(
            next_command(&mut transport).await,
            TransportCommand::Close
        ));

        transport
            .events
            .send(TransportEvent::Disconnected {
                reason: "closed by client".to_string(),
                error: None,
            })
            .await
            .expect("actor alive");

        match next_event(&mut session_events).await.payload {
            EventPayload::ConnectionLost { reason, will_retry } => {
                assert_eq!(reason, "closed by client");
                assert!(!will_retry);
            }
            other => panic!("expected ConnectionLost, got {other:?}"),
        }

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("no timeout")
            .expect("task finished");
        assert!(matches!(result, Err(ConnectionError::SessionClosed)));
    }

    #[tokio::test]
    async fn fatal_negotiation_error_publishes_and_closes() {
        let (session, mut transport) = fake_session(config());
        let mut session_events = session.subscribe("session.error.*").expect("subscribed");

        transport
            .events
            .send(TransportEvent::StreamStart { attrs: vec![] })
            .await
            .expect("actor alive");
        feed(
            &transport,
            "<features xmlns='http://etherx.jabber.org/streams'>\
             <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism></mechanisms></features>",
        )
        .await;
        next_sent(&mut transport).await;
        feed(
            &transport,
            "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>",
        )
        .await;

        match next_event(&mut session_events).await.payload {
            EventPayload::ErrorOccurred {
                message,
                recoverable,
                ..
            } => {
                assert!(message.contains("Authentication failed"));
                assert!(!recoverable);
            }
            other => panic!("expected ErrorOccurred, got {other:?}"),
        }
        assert!(matches!(
            next_command(&mut transport).await,
            TransportCommand::Close
        ));
    }
}
