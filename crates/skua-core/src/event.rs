use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> std::result::Result<Self, crate::error::EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(crate::error::EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Must be lowercase and only contain a-z, 0-9, and dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        let parts: Vec<&str> = name.split('.').collect();
        if parts.is_empty() {
            return false;
        }

        // Check domain
        match parts[0] {
            "session" | "stream" | "roster" | "stanza" => {}
            _ => return false,
        }

        true
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events published by a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "stanza.message.received")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// Identifies the source of an event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// The session controller
    Session,
    /// A transport ("bosh" or "websocket")
    Transport(String),
    /// Application code publishing through the bus
    Application(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum EventPayload {
    // ── Session lifecycle ─────────────────────────────────────────
    ConnectionEstablished {
        jid: String,
    },
    ConnectionLost {
        reason: String,
        will_retry: bool,
    },
    SessionReady {
        jid: String,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Stream negotiation ────────────────────────────────────────
    StreamFeaturesReceived {
        features: String,
    },
    Authenticated {
        mechanism: String,
    },
    Bound {
        jid: String,
    },

    // ── Roster ────────────────────────────────────────────────────
    RosterStart,
    RosterItem {
        item: RosterItem,
    },
    RosterEnd,

    // ── Stanzas ───────────────────────────────────────────────────
    MessageReceived {
        stanza: String,
    },
    PresenceReceived {
        stanza: String,
    },
    IqReceived {
        stanza: String,
    },
    RawStanzaSent {
        stanza: String,
    },
    RawStanzaReceived {
        stanza: String,
    },
}

/// A single entry in the XMPP roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterItem {
    /// The contact's bare JID (e.g., "alice@example.com")
    pub jid: String,

    /// Display name set by the user, if any
    pub name: Option<String>,

    /// Roster subscription state
    pub subscription: Subscription,

    /// User-defined groups this contact belongs to
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subscription {
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }
}

impl std::str::FromStr for Subscription {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            "remove" => Subscription::Remove,
            _ => Subscription::None,
        })
    }
}

/// XMPP presence "show" values (RFC 6121 section 4.7.2.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceShow {
    /// Available (no <show/> element -- the default)
    Available,
    /// Free for chat
    Chat,
    /// Away
    Away,
    /// Extended away
    Xa,
    /// Do not disturb
    Dnd,
}

impl PresenceShow {
    /// The <show/> element text, or `None` for plain available presence.
    pub fn as_show_text(&self) -> Option<&'static str> {
        match self {
            PresenceShow::Available => None,
            PresenceShow::Chat => Some("chat"),
            PresenceShow::Away => Some("away"),
            PresenceShow::Xa => Some("xa"),
            PresenceShow::Dnd => Some("dnd"),
        }
    }
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError>;
    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError>;
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    session_sender: broadcast::Sender<Event>,
    stream_sender: broadcast::Sender<Event>,
    roster_sender: broadcast::Sender<Event>,
    stanza_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (session_sender, _) = broadcast::channel(capacity);
        let (stream_sender, _) = broadcast::channel(capacity);
        let (roster_sender, _) = broadcast::channel(capacity);
        let (stanza_sender, _) = broadcast::channel(capacity);

        Self {
            session_sender,
            stream_sender,
            roster_sender,
            stanza_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "session" => Some(&self.session_sender),
            "stream" => Some(&self.stream_sender),
            "roster" => Some(&self.roster_sender),
            "stanza" => Some(&self.stanza_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(
        &self,
        pattern: &str,
    ) -> std::result::Result<DomainReceivers, crate::error::EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            ));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                session: Some(self.session_sender.subscribe()),
                stream: Some(self.stream_sender.subscribe()),
                roster: Some(self.roster_sender.subscribe()),
                stanza: Some(self.stanza_sender.subscribe()),
            });
        }

        match first_segment {
            "session" => Ok(DomainReceivers {
                session: Some(self.session_sender.subscribe()),
                stream: None,
                roster: None,
                stanza: None,
            }),
            "stream" => Ok(DomainReceivers {
                session: None,
                stream: Some(self.stream_sender.subscribe()),
                roster: None,
                stanza: None,
            }),
            "roster" => Ok(DomainReceivers {
                session: None,
                stream: None,
                roster: Some(self.roster_sender.subscribe()),
                stanza: None,
            }),
            "stanza" => Ok(DomainReceivers {
                session: None,
                stream: None,
                roster: None,
                stanza: Some(self.stanza_sender.subscribe()),
            }),
            _ => Err(crate::error::EventBusError::InvalidPattern(
                pattern.to_string(),
            )),
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> std::result::Result<(), crate::error::EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| {
                crate::error::EventBusError::InvalidChannel(event.channel.to_string())
            })?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> std::result::Result<EventSubscription, crate::error::EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| crate::error::EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

struct DomainReceivers {
    session: Option<broadcast::Receiver<Event>>,
    stream: Option<broadcast::Receiver<Event>>,
    roster: Option<broadcast::Receiver<Event>>,
    stanza: Option<broadcast::Receiver<Event>>,
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> std::result::Result<Event, crate::error::EventBusError> {
        loop {
            let session_receiver = self.receivers.session.as_mut();
            let stream_receiver = self.receivers.stream.as_mut();
            let roster_receiver = self.receivers.roster.as_mut();
            let stanza_receiver = self.receivers.stanza.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(session_receiver) => result,
                result = recv_from_domain(stream_receiver) => result,
                result = recv_from_domain(roster_receiver) => result,
                result = recv_from_domain(stanza_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(crate::error::EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(crate::error::EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> std::result::Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains('*')
        || segment.contains('?')
        || segment.contains('[')
        || segment.contains(']')
        || segment.contains('{')
        || segment.contains('}')
        || segment.contains('!')
}


#[cfg(test)]
mod event_bus_tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn make_event(channel: &str, payload: EventPayload) -> Event {
        Event::new(Channel::new(channel).unwrap(), EventSource::Session, payload)
    }

    #[tokio::test]
    async fn publish_routes_to_matching_domain_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("stanza.**").unwrap();

        bus.publish(make_event(
            "stanza.message.received",
            EventPayload::MessageReceived {
                stanza: "<message/>".into(),
            },
        ))
        .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "stanza.message.received");
    }

    #[tokio::test]
    async fn stanza_event_not_received_by_session_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("session.**").unwrap();

        bus.publish(make_event(
            "stanza.presence.received",
            EventPayload::PresenceReceived {
                stanza: "<presence/>".into(),
            },
        ))
        .unwrap();

        let result = timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(
            result.is_err(),
            "session subscriber should not receive stanza events"
        );
    }

    #[tokio::test]
    async fn publish_succeeds_with_no_subscribers() {
        let bus = BroadcastEventBus::default();
        let result = bus.publish(make_event("roster.start", EventPayload::RosterStart));
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn glob_filters_non_matching_channels_within_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("roster.item").unwrap();

        bus.publish(make_event("roster.start", EventPayload::RosterStart))
            .unwrap();
        bus.publish(make_event(
            "roster.item",
            EventPayload::RosterItem {
                item: RosterItem {
                    jid: "alice@example.com".into(),
                    name: None,
                    subscription: Subscription::Both,
                    groups: vec![],
                },
            },
        ))
        .unwrap();

        let event = timeout(Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "roster.item");
    }

    #[tokio::test]
    async fn firehose_doublestar_receives_all_domains() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("**").unwrap();

        bus.publish(make_event(
            "session.ready",
            EventPayload::SessionReady {
                jid: "a@b/c".into(),
            },
        ))
        .unwrap();
        bus.publish(make_event(
            "stream.bound",
            EventPayload::Bound {
                jid: "a@b/c".into(),
            },
        ))
        .unwrap();
        bus.publish(make_event("roster.end", EventPayload::RosterEnd))
            .unwrap();
        bus.publish(make_event(
            "stanza.iq.received",
            EventPayload::IqReceived {
                stanza: "<iq/>".into(),
            },
        ))
        .unwrap();

        let mut channels = Vec::new();
        for _ in 0..4 {
            let event = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timed out")
                .unwrap();
            channels.push(event.channel.as_str().to_string());
        }

        channels.sort();
        assert_eq!(
            channels,
            vec!["roster.end", "session.ready", "stanza.iq.received", "stream.bound"]
        );
    }

    #[tokio::test]
    async fn events_within_domain_preserve_publish_order() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("stanza.**").unwrap();

        for i in 0..10 {
            bus.publish(make_event(
                "stanza.message.received",
                EventPayload::MessageReceived {
                    stanza: format!("<message id='m{i}'/>"),
                },
            ))
            .unwrap();
        }

        for i in 0..10 {
            let event = timeout(Duration::from_millis(100), sub.recv())
                .await
                .expect("timed out")
                .unwrap();
            match &event.payload {
                EventPayload::MessageReceived { stanza } => {
                    assert!(stanza.contains(&format!("m{i}")), "out of order at {i}");
                }
                _ => panic!("unexpected payload"),
            }
        }
    }

    #[tokio::test]
    async fn subscribe_invalid_pattern_returns_error() {
        let bus = BroadcastEventBus::default();
        assert!(bus.subscribe("[invalid").is_err());
        assert!(bus.subscribe("").is_err());
        assert!(matches!(
            bus.subscribe("unknown.domain.event"),
            Err(crate::error::EventBusError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn lagged_subscriber_returns_lagged_error() {
        let bus = BroadcastEventBus::new(2);
        let mut sub = bus.subscribe("session.**").unwrap();

        for i in 0..10 {
            bus.publish(make_event(
                "session.error.occurred",
                EventPayload::ErrorOccurred {
                    component: "test".into(),
                    message: format!("event {i}"),
                    recoverable: true,
                },
            ))
            .unwrap();
        }

        let result = sub.recv().await;
        assert!(
            matches!(result, Err(crate::error::EventBusError::Lagged(_))),
            "expected Lagged error, got {result:?}"
        );
    }

    #[tokio::test]
    async fn channel_closed_when_bus_dropped() {
        let mut sub;
        {
            let bus = BroadcastEventBus::default();
            sub = bus.subscribe("session.**").unwrap();
        }

        let result = sub.recv().await;
        assert!(matches!(
            result,
            Err(crate::error::EventBusError::ChannelClosed)
        ));
    }
}
