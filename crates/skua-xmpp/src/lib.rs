//! Client-side XMPP session engine.
//!
//! Assembles stanzas from streamed XML, authenticates over SASL,
//! negotiates stream features through to a ready session, and carries the
//! stream over BOSH or WebSocket. Application code talks to a [`Session`]
//! handle and observes everything else through `skua-core` bus events.

pub mod builder;
pub mod correlator;
pub mod error;
pub mod negotiator;
pub mod ns;
pub mod roster;
pub mod sasl;
pub mod session;
pub mod transport;
pub mod xml;

pub use builder::{StanzaBuilder, StreamEvent};
pub use correlator::IqCorrelator;
pub use error::ConnectionError;
pub use negotiator::{NegotiationPhase, PresenceSpec, StreamNegotiator};
pub use sasl::{Credentials, SelectedMechanism};
pub use session::{Session, SessionConfig};
pub use transport::{bosh::BoshConfig, websocket::WebSocketConfig, TransportConfig};
