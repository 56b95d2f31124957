//! Transport actors: BOSH long-polling and RFC 7395 WebSocket framing.
//!
//! Both transports run as independent tasks and present the same
//! event/command channel pair to the session actor, so the session never
//! needs to know which one carries its stream.

pub mod bosh;
pub mod websocket;

use minidom::Element;
use tokio::sync::mpsc;

use crate::error::ConnectionError;

/// Events a transport delivers to the session actor, in stream order.
#[derive(Debug)]
pub enum TransportEvent {
    /// A stream (or BOSH session) opened. Carries the raw attributes of
    /// the stream header / creation body.
    StreamStart { attrs: Vec<(String, String)> },
    /// One complete stanza.
    Stanza(Element),
    /// The server closed the stream cleanly.
    StreamEnd,
    /// The transport is gone. Terminal; no further events follow.
    Disconnected {
        reason: String,
        error: Option<ConnectionError>,
    },
}

/// Commands the session actor sends to its transport.
#[derive(Debug)]
pub enum TransportCommand {
    Send(Element),
    /// Restart the XML stream after SASL success.
    Restart,
    /// Terminate cleanly (BOSH `type='terminate'`, WebSocket `<close/>`).
    Close,
}

/// The channel pair connecting a session actor to its transport task.
pub struct TransportLink {
    pub commands: mpsc::Sender<TransportCommand>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Which wire carries the stream.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    Bosh(bosh::BoshConfig),
    WebSocket(websocket::WebSocketConfig),
}

/// Connect the configured transport, returning its link. BOSH performs
/// session creation inline so pre-session HTTP failures surface here as
/// hard errors instead of disconnect events.
pub async fn connect(
    config: &TransportConfig,
    domain: &str,
) -> Result<TransportLink, ConnectionError> {
    match config {
        TransportConfig::Bosh(bosh) => bosh::connect(bosh.clone(), domain.to_string()).await,
        TransportConfig::WebSocket(ws) => {
            websocket::connect(ws.clone(), domain.to_string()).await
        }
    }
}
