//! BOSH transport (XEP-0124/XEP-0206).
//!
//! Split in two: `BoshSession` is a pure state machine owning rid/sid, the
//! two request slots, the send queue, the backoff table and the dead-time
//! clock; the driver task owns the HTTP client and feeds the machine with
//! completions. Every request decision is unit-testable without I/O.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use minidom::Element;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::builder::{StanzaBuilder, StreamEvent};
use crate::error::ConnectionError;

use super::{TransportCommand, TransportEvent, TransportLink};

/// Delays between retries after transient HTTP failures; the last entry
/// holds.
const BACKOFF_SECS: [u64; 4] = [1, 2, 5, 10];

/// At most two HTTP requests in flight (XEP-0124 section 11).
const MAX_BUSY: u8 = 2;

#[derive(Debug, Clone)]
pub struct BoshConfig {
    /// The connection manager endpoint, e.g. `https://example.com/http-bind`.
    pub url: String,
    /// Longest poll the server may hold a request (seconds).
    pub wait_secs: u64,
    /// Requests the server may hold back (XEP-0124 `hold`).
    pub hold: u8,
    /// Driver tick interval.
    pub poll_interval: Duration,
}

impl BoshConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            wait_secs: 60,
            hold: 1,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Create,
    Poll,
    Stanzas,
    Restart,
    Terminate,
}

#[derive(Debug)]
pub struct BoshRequest {
    pub rid: u64,
    pub body: String,
    pub kind: RequestKind,
    /// Stanzas carried by this request, kept so a failed request can be
    /// requeued under a fresh rid.
    pub stanzas: Vec<Element>,
}

#[derive(Debug)]
pub enum ErrorDisposition {
    Fatal(ConnectionError),
    RetryAfter(Duration),
}

#[derive(Debug)]
pub struct ResponseDisposition {
    pub server_terminated: bool,
}

pub struct BoshSession {
    to: String,
    config: BoshConfig,
    next_rid: u64,
    sid: Option<String>,
    busy: u8,
    queue: VecDeque<Element>,
    /// Payloads of failed requests, keyed by the rid they went out under.
    /// Resent in ascending-rid order ahead of newer queued stanzas, so the
    /// caller's send order survives retries.
    parked: BTreeMap<u64, Vec<Element>>,
    restart_pending: bool,
    terminating: bool,
    terminate_sent: bool,
    server_terminated: bool,
    failed: bool,
    /// Seconds of silence the server tolerates before discarding the
    /// session; refined from the creation response.
    inactivity: Duration,
    /// Longest poll the server will actually hold; starts at the client's
    /// requested value and is replaced by the creation response.
    wait: Duration,
    backoff_idx: Option<usize>,
    retry_at: Option<Instant>,
    dead_since: Option<Instant>,
}

impl BoshSession {
    pub fn new(domain: String, config: BoshConfig) -> Self {
        // 53-bit-safe random seed; rids only ever move forward from here.
        let seed = rand::rng().random_range(0..(1u64 << 52));
        Self {
            to: domain,
            inactivity: Duration::from_secs(config.wait_secs),
            wait: Duration::from_secs(config.wait_secs),
            config,
            next_rid: seed,
            sid: None,
            busy: 0,
            queue: VecDeque::new(),
            parked: BTreeMap::new(),
            restart_pending: false,
            terminating: false,
            terminate_sent: false,
            server_terminated: false,
            failed: false,
            backoff_idx: None,
            retry_at: None,
            dead_since: None,
        }
    }

    fn take_rid(&mut self) -> u64 {
        let rid = self.next_rid;
        self.next_rid += 1;
        rid
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn busy(&self) -> u8 {
        self.busy
    }

    pub fn queue_stanza(&mut self, stanza: Element) {
        self.queue.push_back(stanza);
    }

    /// Park a failed request's payload for resending. The retry goes out
    /// under a fresh rid; rids are never reused. Parked payloads are keyed
    /// by their original rid so that when both in-flight requests fail,
    /// the resend keeps the original send order regardless of which
    /// failure completion arrives first.
    pub fn park_failed(&mut self, rid: u64, stanzas: Vec<Element>) {
        if !stanzas.is_empty() {
            self.parked.insert(rid, stanzas);
        }
    }

    /// Everything waiting to go out: parked retries in ascending-rid
    /// order, then the queue.
    fn take_pending(&mut self) -> Vec<Element> {
        let mut stanzas: Vec<Element> = Vec::new();
        for (_, batch) in std::mem::take(&mut self.parked) {
            stanzas.extend(batch);
        }
        stanzas.extend(self.queue.drain(..));
        stanzas
    }

    fn has_pending(&self) -> bool {
        !self.queue.is_empty() || !self.parked.is_empty()
    }

    pub fn request_restart(&mut self) {
        self.restart_pending = true;
    }

    pub fn begin_terminate(&mut self) {
        self.terminating = true;
        self.terminate_sent = false;
    }

    pub fn is_finished(&self) -> bool {
        self.failed
            || (self.busy == 0 && (self.server_terminated || (self.terminating && self.terminate_sent)))
    }

    /// The session-creation request. Sent inline by `connect()` before the
    /// polling loop starts.
    pub fn creation_request(&mut self) -> BoshRequest {
        let rid = self.take_rid();
        self.busy += 1;
        let body = format!(
            "<body xmlns='{}' xmlns:xmpp='{}' xmlns:stream='{}' \
             rid='{rid}' to='{}' xml:lang='en' ver='1.6' wait='{}' hold='{}' \
             content='text/xml; charset=utf-8' xmpp:version='1.0'/>",
            crate::ns::HTTPBIND,
            crate::ns::XBOSH,
            crate::ns::STREAM,
            self.to,
            self.config.wait_secs,
            self.config.hold
        );
        BoshRequest {
            rid,
            body,
            kind: RequestKind::Create,
            stanzas: Vec::new(),
        }
    }

    /// One turn of the polling loop. Returns the next request to POST, or
    /// `None` when nothing should go out right now.
    pub fn tick(&mut self, now: Instant) -> Option<BoshRequest> {
        if self.failed || self.server_terminated || self.sid.is_none() {
            return None;
        }
        if let Some(retry_at) = self.retry_at {
            if now < retry_at {
                return None;
            }
            self.retry_at = None;
        }

        if self.terminating {
            if self.terminate_sent || self.busy >= MAX_BUSY {
                return None;
            }
            self.terminate_sent = true;
            let stanzas = self.take_pending();
            return Some(self.build_request(RequestKind::Terminate, stanzas));
        }

        if self.restart_pending && self.busy < MAX_BUSY {
            self.restart_pending = false;
            return Some(self.build_request(RequestKind::Restart, Vec::new()));
        }

        if self.has_pending() && self.busy < MAX_BUSY {
            let stanzas = self.take_pending();
            return Some(self.build_request(RequestKind::Stanzas, stanzas));
        }

        // BOSH requires at least one outstanding request while alive.
        if !self.has_pending() && self.busy == 0 {
            return Some(self.build_request(RequestKind::Poll, Vec::new()));
        }

        None
    }

    fn build_request(&mut self, kind: RequestKind, stanzas: Vec<Element>) -> BoshRequest {
        let rid = self.take_rid();
        self.busy += 1;
        let sid = self.sid.as_deref().unwrap_or_default();

        let mut body = format!(
            "<body xmlns='{}' rid='{rid}' sid='{sid}'",
            crate::ns::HTTPBIND
        );
        match kind {
            RequestKind::Restart => {
                body.push_str(&format!(
                    " xmlns:xmpp='{}' to='{}' xmpp:restart='true'/>",
                    crate::ns::XBOSH,
                    self.to
                ));
            }
            RequestKind::Terminate => {
                body.push_str(" type='terminate'>");
                for stanza in &stanzas {
                    body.push_str(&String::from(stanza));
                }
                body.push_str("</body>");
            }
            _ if stanzas.is_empty() => body.push_str("/>"),
            _ => {
                body.push('>');
                for stanza in &stanzas {
                    body.push_str(&String::from(stanza));
                }
                body.push_str("</body>");
            }
        }

        BoshRequest {
            rid,
            body,
            kind,
            stanzas,
        }
    }

    /// Account for a successful HTTP response whose `<body/>` attributes
    /// are given. Stanza children are forwarded by the driver.
    pub fn on_response(
        &mut self,
        attrs: &[(String, String)],
    ) -> Result<ResponseDisposition, ConnectionError> {
        self.busy = self.busy.saturating_sub(1);
        self.backoff_idx = None;
        self.retry_at = None;
        self.dead_since = None;

        let attr = |name: &str| {
            attrs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };

        if self.sid.is_none() {
            let sid = attr("sid").ok_or_else(|| {
                ConnectionError::StreamError(
                    "BOSH creation response carried no sid".to_string(),
                )
            })?;
            self.sid = Some(sid.to_string());
            if let Some(secs) = attr("inactivity").and_then(|v| v.parse::<u64>().ok()) {
                self.inactivity = Duration::from_secs(secs);
            }
            if let Some(secs) = attr("wait").and_then(|v| v.parse::<u64>().ok()) {
                self.wait = Duration::from_secs(secs);
            }
            debug!(
                sid = %sid,
                inactivity = ?self.inactivity,
                wait = ?self.wait,
                "BOSH session created"
            );
        }

        let server_terminated = attr("type") == Some("terminate");
        if server_terminated {
            let condition = attr("condition").unwrap_or("none");
            debug!(condition, "server terminated BOSH session");
            self.server_terminated = true;
        }

        Ok(ResponseDisposition { server_terminated })
    }

    /// Account for a failed HTTP request. Before session creation every
    /// failure is fatal; afterwards failures are retried on the backoff
    /// table until the server's inactivity budget runs out.
    pub fn on_request_error(&mut self, error: &str, now: Instant) -> ErrorDisposition {
        self.busy = self.busy.saturating_sub(1);

        if self.sid.is_none() {
            self.failed = true;
            return ErrorDisposition::Fatal(ConnectionError::TransportError(format!(
                "BOSH session creation failed: {error}"
            )));
        }

        let dead_since = *self.dead_since.get_or_insert(now);
        let elapsed = now.duration_since(dead_since);
        if elapsed > self.inactivity {
            self.failed = true;
            return ErrorDisposition::Fatal(ConnectionError::InactivityExceeded {
                elapsed_secs: elapsed.as_secs(),
                budget_secs: self.inactivity.as_secs(),
            });
        }

        let idx = match self.backoff_idx {
            None => 0,
            Some(i) => (i + 1).min(BACKOFF_SECS.len() - 1),
        };
        self.backoff_idx = Some(idx);
        let delay = Duration::from_secs(BACKOFF_SECS[idx]);
        self.retry_at = Some(now + delay);
        debug!(error, delay_secs = BACKOFF_SECS[idx], "BOSH request failed, will retry");
        ErrorDisposition::RetryAfter(delay)
    }

    /// HTTP timeout for one request: the server may hold it for the
    /// negotiated `wait`, plus slack for transit.
    pub fn request_timeout(&self) -> Duration {
        self.wait + Duration::from_secs(10)
    }
}

/// Create the BOSH session inline, then hand the polling loop to a task.
pub async fn connect(
    config: BoshConfig,
    domain: String,
) -> Result<TransportLink, ConnectionError> {
    let client = reqwest::Client::builder()
        .build()
        .map_err(|err| ConnectionError::TransportError(err.to_string()))?;

    let mut session = BoshSession::new(domain, config.clone());
    let request = session.creation_request();
    let text = post(&client, &config.url, request.body, session.request_timeout())
        .await
        .map_err(|err| {
            ConnectionError::TransportError(format!("BOSH session creation failed: {err}"))
        })?;

    let (attrs, stanzas) = parse_body(&text)?;
    session.on_response(&attrs)?;

    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);

    let mut initial_events = vec![TransportEvent::StreamStart {
        attrs: attrs.clone(),
    }];
    initial_events.extend(stanzas.into_iter().map(TransportEvent::Stanza));

    tokio::spawn(run(session, client, command_rx, event_tx, initial_events));

    Ok(TransportLink {
        commands: command_tx,
        events: event_rx,
    })
}

struct InFlight {
    kind: RequestKind,
    stanzas: Vec<Element>,
}

async fn run(
    mut session: BoshSession,
    client: reqwest::Client,
    mut commands: mpsc::Receiver<TransportCommand>,
    events: mpsc::Sender<TransportEvent>,
    initial_events: Vec<TransportEvent>,
) {
    for event in initial_events {
        if events.send(event).await.is_err() {
            return;
        }
    }

    let url = session.config.url.clone();
    let (done_tx, mut done_rx) = mpsc::channel::<(u64, Result<String, String>)>(8);
    let mut interval = tokio::time::interval(session.config.poll_interval);
    let mut in_flight: HashMap<u64, InFlight> = HashMap::new();
    let mut commands_open = true;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                while let Some(request) = session.tick(now) {
                    in_flight.insert(request.rid, InFlight {
                        kind: request.kind,
                        stanzas: request.stanzas,
                    });
                    let client = client.clone();
                    let url = url.clone();
                    let done_tx = done_tx.clone();
                    let rid = request.rid;
                    let body = request.body;
                    let timeout = session.request_timeout();
                    tokio::spawn(async move {
                        let result = post(&client, &url, body, timeout).await;
                        let _ = done_tx.send((rid, result)).await;
                    });
                }
            }
            command = commands.recv(), if commands_open => match command {
                Some(TransportCommand::Send(stanza)) => session.queue_stanza(stanza),
                Some(TransportCommand::Restart) => session.request_restart(),
                Some(TransportCommand::Close) => session.begin_terminate(),
                // Session gone; wind the HTTP session down too.
                None => {
                    commands_open = false;
                    session.begin_terminate();
                }
            },
            Some((rid, result)) = done_rx.recv() => {
                let meta = in_flight.remove(&rid);
                match result {
                    Ok(text) => {
                        let parsed = parse_body(&text);
                        match parsed {
                            Ok((attrs, stanzas)) => {
                                match session.on_response(&attrs) {
                                    Ok(_) => {}
                                    Err(err) => {
                                        let _ = events.send(TransportEvent::Disconnected {
                                            reason: err.to_string(),
                                            error: Some(err),
                                        }).await;
                                        return;
                                    }
                                }
                                if matches!(meta.as_ref().map(|m| m.kind), Some(RequestKind::Restart)) {
                                    if events.send(TransportEvent::StreamStart {
                                        attrs: attrs.clone(),
                                    }).await.is_err() {
                                        return;
                                    }
                                }
                                for stanza in stanzas {
                                    if events.send(TransportEvent::Stanza(stanza)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Err(err) => {
                                let _ = events.send(TransportEvent::Disconnected {
                                    reason: err.to_string(),
                                    error: Some(err),
                                }).await;
                                return;
                            }
                        }
                    }
                    Err(error) => {
                        if let Some(meta) = meta {
                            session.park_failed(rid, meta.stanzas);
                            match meta.kind {
                                RequestKind::Restart => session.request_restart(),
                                RequestKind::Terminate => session.begin_terminate(),
                                _ => {}
                            }
                        }
                        match session.on_request_error(&error, Instant::now()) {
                            ErrorDisposition::Fatal(err) => {
                                warn!(error = %err, "BOSH transport failed");
                                let _ = events.send(TransportEvent::Disconnected {
                                    reason: err.to_string(),
                                    error: Some(err),
                                }).await;
                                return;
                            }
                            // Retry silently; the next tick past the delay
                            // reissues the payload under a fresh rid.
                            ErrorDisposition::RetryAfter(_) => {}
                        }
                    }
                }
            }
        }

        if session.is_finished() {
            let reason = if session.server_terminated {
                "server terminated the session"
            } else {
                "closed by client"
            };
            let _ = events
                .send(TransportEvent::Disconnected {
                    reason: reason.to_string(),
                    error: None,
                })
                .await;
            return;
        }
    }
}

async fn post(
    client: &reqwest::Client,
    url: &str,
    body: String,
    timeout: Duration,
) -> Result<String, String> {
    let response = client
        .post(url)
        .header("Content-Type", "text/xml; charset=utf-8")
        .timeout(timeout)
        .body(body)
        .send()
        .await
        .map_err(|err| err.to_string())?;

    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    response.text().await.map_err(|err| err.to_string())
}

/// Parse one HTTP response through the stanza builder: the `<body/>` root
/// becomes the attribute set, its children the stanzas.
fn parse_body(text: &str) -> Result<(Vec<(String, String)>, Vec<Element>), ConnectionError> {
    let mut builder = StanzaBuilder::new();
    let mut attrs = None;
    let mut stanzas = Vec::new();

    for event in builder.feed(text) {
        match event {
            StreamEvent::StreamStart { name, attrs: a } => {
                if name != "body" {
                    return Err(ConnectionError::XmlError(format!(
                        "expected BOSH <body/>, got <{name}/>"
                    )));
                }
                attrs = Some(a);
            }
            StreamEvent::Stanza(stanza) => stanzas.push(stanza),
            StreamEvent::StreamEnd => {}
            StreamEvent::StreamError(message) => {
                return Err(ConnectionError::XmlError(message));
            }
        }
    }

    let attrs = attrs.ok_or_else(|| {
        ConnectionError::XmlError("BOSH response is not a body document".to_string())
    })?;
    Ok((attrs, stanzas))
}
