//! WebSocket transport (RFC 7395).
//!
//! Each WebSocket text frame carries exactly one element. `<open/>` and
//! `<close/>` framing elements are translated to stream header/trailer
//! form and run through the same stanza builder as any other transport,
//! so namespace scoping behaves identically on both wires.

use futures::{SinkExt, StreamExt};
use minidom::Element;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::builder::{StanzaBuilder, StreamEvent};
use crate::error::ConnectionError;
use crate::ns;

use super::{TransportCommand, TransportEvent, TransportLink};

#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Endpoint, e.g. `wss://example.com/xmpp-websocket`.
    pub url: String,
}

impl WebSocketConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// The `<open/>` frame initiating (or restarting) a stream.
fn open_frame(domain: &str) -> String {
    format!(
        "<open xmlns='{}' to='{}' version='1.0'/>",
        ns::FRAMING,
        domain
    )
}

fn close_frame() -> String {
    format!("<close xmlns='{}'/>", ns::FRAMING)
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('\'', "&apos;")
}

/// Translate a framing `<open/>` into an equivalent `<stream:stream>`
/// header, carrying over all attributes except the framing namespace.
fn translate_open(frame: &str) -> Option<String> {
    let trimmed = frame.trim_start();
    if !trimmed.starts_with("<open") {
        return None;
    }
    let el: Element = trimmed.parse().ok()?;
    if !el.is("open", ns::FRAMING) {
        return None;
    }

    let mut header = format!(
        "<stream:stream xmlns='{}' xmlns:stream='{}'",
        ns::CLIENT,
        ns::STREAM
    );
    for (name, value) in el.attrs() {
        if name == "xmlns" {
            continue;
        }
        header.push(' ');
        header.push_str(name);
        header.push_str("='");
        header.push_str(&escape_attr(value));
        header.push('\'');
    }
    header.push('>');
    Some(header)
}

fn is_close(frame: &str) -> bool {
    let trimmed = frame.trim_start();
    if !trimmed.starts_with("<close") {
        return false;
    }
    trimmed
        .parse::<Element>()
        .map(|el| el.is("close", ns::FRAMING))
        .unwrap_or(false)
}

pub async fn connect(
    config: WebSocketConfig,
    domain: String,
) -> Result<TransportLink, ConnectionError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| ConnectionError::TransportError(err.to_string()))?;
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("xmpp"));

    let (stream, _response) = connect_async(request)
        .await
        .map_err(|err| ConnectionError::TransportError(err.to_string()))?;
    debug!(url = %config.url, "WebSocket connected");

    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);

    tokio::spawn(run(stream, domain, command_rx, event_tx));

    Ok(TransportLink {
        commands: command_tx,
        events: event_rx,
    })
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run(
    stream: WsStream,
    domain: String,
    mut commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
) {
    let (mut sink, mut frames) = stream.split();
    let mut builder = StanzaBuilder::new();
    let mut closing = false;
    let mut commands_open = true;

    if sink
        .send(Message::Text(open_frame(&domain).into()))
        .await
        .is_err()
    {
        let _ = events
            .send(TransportEvent::Disconnected {
                reason: "failed to send stream open".to_string(),
                error: Some(ConnectionError::TransportError(
                    "failed to send stream open".to_string(),
                )),
            })
            .await;
        return;
    }

    loop {
        tokio::select! {
            command = commands.recv(), if commands_open => match command {
                // Session gone; close the stream cleanly.
                None => {
                    commands_open = false;
                    closing = true;
                    if sink.send(Message::Text(close_frame().into())).await.is_err() {
                        return;
                    }
                }
                Some(TransportCommand::Send(stanza)) => {
                    let text = String::from(&stanza);
                    if let Err(err) = sink.send(Message::Text(text.into())).await {
                        let _ = events.send(TransportEvent::Disconnected {
                            reason: err.to_string(),
                            error: Some(ConnectionError::TransportError(err.to_string())),
                        }).await;
                        return;
                    }
                }
                Some(TransportCommand::Restart) => {
                    builder.reset();
                    if let Err(err) = sink.send(Message::Text(open_frame(&domain).into())).await {
                        let _ = events.send(TransportEvent::Disconnected {
                            reason: err.to_string(),
                            error: Some(ConnectionError::TransportError(err.to_string())),
                        }).await;
                        return;
                    }
                }
                Some(TransportCommand::Close) => {
                    closing = true;
                    if sink.send(Message::Text(close_frame().into())).await.is_err() {
                        let _ = events.send(TransportEvent::Disconnected {
                            reason: "closed".to_string(),
                            error: None,
                        }).await;
                        return;
                    }
                }
            },
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str();
                    if is_close(text) {
                        if !closing {
                            // Server-initiated close; answer in kind.
                            let _ = sink.send(Message::Text(close_frame().into())).await;
                        }
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = events.send(TransportEvent::StreamEnd).await;
                        let _ = events.send(TransportEvent::Disconnected {
                            reason: "stream closed".to_string(),
                            error: None,
                        }).await;
                        return;
                    }

                    let input = match translate_open(text) {
                        Some(header) => header,
                        None => text.to_string(),
                    };
                    for event in builder.feed(&input) {
                        let out = match event {
                            StreamEvent::StreamStart { attrs, .. } => {
                                TransportEvent::StreamStart { attrs }
                            }
                            StreamEvent::Stanza(stanza) => TransportEvent::Stanza(stanza),
                            StreamEvent::StreamEnd => TransportEvent::StreamEnd,
                            StreamEvent::StreamError(message) => {
                                warn!(message = %message, "malformed frame");
                                let _ = events.send(TransportEvent::Disconnected {
                                    reason: message.clone(),
                                    error: Some(ConnectionError::XmlError(message)),
                                }).await;
                                return;
                            }
                        };
                        if events.send(out).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let reason = if closing {
                        "closed".to_string()
                    } else {
                        "connection closed by peer".to_string()
                    };
                    let error = (!closing).then(|| ConnectionError::TransportError(reason.clone()));
                    let _ = events.send(TransportEvent::Disconnected { reason, error }).await;
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    let _ = events.send(TransportEvent::Disconnected {
                        reason: err.to_string(),
                        error: Some(ConnectionError::TransportError(err.to_string())),
                    }).await;
                    return;
                }
            }
        }
    }
}
