//! Minimal echo bot: connects over WebSocket, waits for the session to
//! become ready, then echoes every chat message body back to its sender.
//!
//! ```sh
//! SKUA_WS_URL=wss://example.com/xmpp-websocket \
//! SKUA_JID=bot@example.com SKUA_PASSWORD=secret \
//! cargo run --example echo
//! ```

use minidom::Element;
use skua_core::EventPayload;
use skua_xmpp::{PresenceSpec, Session, SessionConfig, TransportConfig, WebSocketConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,skua_xmpp=debug".into()),
        )
        .init();

    let url = std::env::var("SKUA_WS_URL")?;
    let jid = std::env::var("SKUA_JID")?;
    let password = std::env::var("SKUA_PASSWORD")?;
    let (username, domain) = jid
        .split_once('@')
        .ok_or("SKUA_JID must look like user@domain")?;

    let session = Session::connect(SessionConfig {
        username: username.to_string(),
        password,
        domain: domain.to_string(),
        transport: TransportConfig::WebSocket(WebSocketConfig::new(url)),
        resource: Some("echo".to_string()),
        request_roster: true,
        send_initial_presence: true,
        presence: PresenceSpec::default(),
    })
    .await?;

    let mut lifecycle = session.subscribe("session.*")?;
    let mut messages = session.subscribe("stanza.message.received")?;

    loop {
        tokio::select! {
            event = lifecycle.recv() => match event?.payload {
                EventPayload::SessionReady { jid } => {
                    tracing::info!(%jid, "ready");
                }
                EventPayload::ConnectionLost { reason, .. } => {
                    tracing::info!(reason, "connection lost, exiting");
                    return Ok(());
                }
                _ => {}
            },
            event = messages.recv() => {
                if let EventPayload::MessageReceived { stanza } = event?.payload {
                    let message: Element = stanza.parse()?;
                    let Some(from) = message.attr("from") else { continue };
                    let Some(body) = message
                        .get_child("body", "jabber:client")
                        .map(|b| b.text())
                    else {
                        continue;
                    };

                    let mut reply_body = Element::bare("body", "jabber:client");
                    reply_body.append_text_node(body);
                    let reply = Element::builder("message", "jabber:client")
                        .attr("to", from)
                        .attr("type", "chat")
                        .append(reply_body)
                        .build();
                    session.send(reply).await?;
                }
            }
        }
    }
}
