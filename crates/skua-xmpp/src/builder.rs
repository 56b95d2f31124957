//! Stanza assembly: turns the token stream into complete stanza trees.
//!
//! The first open tag is the stream root; it is never pushed onto the open
//! stack, only remembered so depth-1 subtrees can be recognized. Each
//! depth-1 subtree becomes one `minidom::Element` and is emitted the moment
//! its close tag arrives. Namespace resolution uses an explicit scope chain
//! per builder, so sessions never share parser state.

use std::sync::Arc;

use minidom::Element;
use tracing::debug;

use crate::xml::{NsScope, RawToken, TokenStream};

#[derive(Debug)]
pub enum StreamEvent {
    /// The stream root opened. Carries the root's local name and its raw
    /// attributes (BOSH exposes `sid`/`type`/`inactivity` this way).
    StreamStart {
        name: String,
        attrs: Vec<(String, String)>,
    },
    /// A depth-1 subtree completed.
    Stanza(Element),
    /// The stream root closed.
    StreamEnd,
    /// Fatal parse failure. The builder accepts no further input until
    /// `reset()`.
    StreamError(String),
}

struct RootFrame {
    qname: String,
    scope: Arc<NsScope>,
}

struct Frame {
    qname: String,
    scope: Arc<NsScope>,
    element: Element,
}

pub struct StanzaBuilder {
    tokens: TokenStream,
    base_scope: Arc<NsScope>,
    root: Option<RootFrame>,
    stack: Vec<Frame>,
    dead: bool,
}

impl Default for StanzaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StanzaBuilder {
    pub fn new() -> Self {
        Self {
            tokens: TokenStream::new(),
            base_scope: NsScope::root(),
            root: None,
            stack: Vec::new(),
            dead: false,
        }
    }

    /// Restore pristine state. Required after SASL success, which restarts
    /// the stream context.
    pub fn reset(&mut self) {
        self.tokens.reset();
        self.root = None;
        self.stack.clear();
        self.dead = false;
    }

    /// Feed a chunk of stream input and collect every event it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<StreamEvent> {
        if self.dead {
            return Vec::new();
        }

        self.tokens.write(chunk);
        let tokens = match self.tokens.drain() {
            Ok(tokens) => tokens,
            Err(err) => return vec![self.fail(err.to_string())],
        };

        let mut events = Vec::new();
        for token in tokens {
            match self.process(token, &mut events) {
                Ok(()) => {}
                Err(message) => {
                    events.push(self.fail(message));
                    break;
                }
            }
        }
        events
    }

    fn fail(&mut self, message: String) -> StreamEvent {
        debug!(error = %message, "stream parse failed");
        self.dead = true;
        StreamEvent::StreamError(message)
    }

    fn current_scope(&self) -> &Arc<NsScope> {
        if let Some(frame) = self.stack.last() {
            &frame.scope
        } else if let Some(root) = &self.root {
            &root.scope
        } else {
            &self.base_scope
        }
    }

    fn process(&mut self, token: RawToken, events: &mut Vec<StreamEvent>) -> Result<(), String> {
        match token {
            RawToken::Open {
                name,
                attrs,
                self_closing,
            } => self.open(name, attrs, self_closing, events),
            RawToken::Text(value) => {
                if let Some(frame) = self.stack.last_mut() {
                    frame.element.append_text_node(value);
                }
                // Text outside any stanza is keep-alive whitespace.
                Ok(())
            }
            RawToken::Close { name } => self.close(name, events),
        }
    }

    fn open(
        &mut self,
        qname: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), String> {
        let scope = NsScope::child(self.current_scope(), &attrs);
        let (namespace, local) = scope.resolve_element(&qname)?;

        if self.root.is_none() {
            self.root = Some(RootFrame {
                qname,
                scope,
            });
            events.push(StreamEvent::StreamStart { name: local, attrs });
            if self_closing {
                self.root = None;
                events.push(StreamEvent::StreamEnd);
            }
            return Ok(());
        }

        let namespace =
            namespace.ok_or_else(|| format!("element '{local}' has no namespace in scope"))?;
        let mut element = Element::bare(local, namespace);
        for (key, value) in &attrs {
            if key == "xmlns" || key.starts_with("xmlns:") {
                continue;
            }
            element.set_attr(key.as_str(), value.as_str());
        }

        if self_closing {
            self.complete(element, events);
        } else {
            self.stack.push(Frame {
                qname,
                scope,
                element,
            });
        }
        Ok(())
    }

    fn close(&mut self, qname: String, events: &mut Vec<StreamEvent>) -> Result<(), String> {
        if let Some(frame) = self.stack.pop() {
            if frame.qname != qname {
                return Err(format!(
                    "mismatched close tag: expected '{}', got '{qname}'",
                    frame.qname
                ));
            }
            self.complete(frame.element, events);
            return Ok(());
        }

        match self.root.take() {
            Some(root) if root.qname == qname => {
                events.push(StreamEvent::StreamEnd);
                Ok(())
            }
            Some(root) => Err(format!(
                "mismatched stream close: expected '{}', got '{qname}'",
                root.qname
            )),
            None => Err(format!("close tag '{qname}' with no open element")),
        }
    }

    /// Attach a finished element to its parent, or emit it if it sits at
    /// depth 1 under the stream root.
    fn complete(&mut self, element: Element, events: &mut Vec<StreamEvent>) {
        match self.stack.last_mut() {
            Some(parent) => {
                parent.element.append_child(element);
            }
            None => events.push(StreamEvent::Stanza(element)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM_HEADER: &str = "<stream:stream xmlns='jabber:client' \
         xmlns:stream='http://etherx.jabber.org/streams' from='example.com' \
         id='s1' version='1.0'>";

    fn fingerprint(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .map(|ev| match ev {
                StreamEvent::StreamStart { name, .. } => format!("start:{name}"),
                StreamEvent::Stanza(el) => format!("stanza:{}", String::from(el)),
                StreamEvent::StreamEnd => "end".to_string(),
                StreamEvent::StreamError(msg) => format!("error:{msg}"),
            })
            .collect()
    }

    #[test]
    fn emits_stream_start_with_attrs() {
        let mut builder = StanzaBuilder::new();
        let events = builder.feed(STREAM_HEADER);

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::StreamStart { name, attrs } => {
                assert_eq!(name, "stream");
                assert!(attrs.contains(&("from".to_string(), "example.com".to_string())));
                assert!(attrs.contains(&("id".to_string(), "s1".to_string())));
            }
            other => panic!("expected StreamStart, got {other:?}"),
        }
    }

    #[test]
    fn emits_stanza_on_depth_one_close() {
        let mut builder = StanzaBuilder::new();
        builder.feed(STREAM_HEADER);
        let events = builder.feed("<message to='a@b'><body>hi</body></message>");

        assert_eq!(events.len(), 1);
        match &events[0] {
            StreamEvent::Stanza(el) => {
                assert!(el.is("message", "jabber:client"));
                assert_eq!(el.attr("to"), Some("a@b"));
                let body = el.get_child("body", "jabber:client").expect("body child");
                assert_eq!(body.text(), "hi");
            }
            other => panic!("expected Stanza, got {other:?}"),
        }
    }

    #[test]
    fn nested_children_attach_in_document_order() {
        let mut builder = StanzaBuilder::new();
        builder.feed(STREAM_HEADER);
        let events = builder.feed(
            "<iq type='result' id='r1'><query xmlns='jabber:iq:roster'>\
             <item jid='a@x'/><item jid='b@x'/></query></iq>",
        );

        match &events[0] {
            StreamEvent::Stanza(el) => {
                let query = el.get_child("query", "jabber:iq:roster").expect("query");
                let jids: Vec<_> = query.children().filter_map(|c| c.attr("jid")).collect();
                assert_eq!(jids, vec!["a@x", "b@x"]);
            }
            other => panic!("expected Stanza, got {other:?}"),
        }
    }

    #[test]
    fn prefixed_elements_resolve_through_scope_chain() {
        let mut builder = StanzaBuilder::new();
        builder.feed(STREAM_HEADER);
        let events = builder.feed(
            "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>PLAIN</mechanism></mechanisms></stream:features>",
        );

        match &events[0] {
            StreamEvent::Stanza(el) => {
                assert!(el.is("features", "http://etherx.jabber.org/streams"));
                assert!(el
                    .get_child("mechanisms", "urn:ietf:params:xml:ns:xmpp-sasl")
                    .is_some());
            }
            other => panic!("expected Stanza, got {other:?}"),
        }
    }

    #[test]
    fn unbound_prefix_is_fatal() {
        let mut builder = StanzaBuilder::new();
        builder.feed(STREAM_HEADER);
        let events = builder.feed("<bogus:thing/>");

        assert!(matches!(&events[0], StreamEvent::StreamError(_)));
        // Dead after a stream error.
        assert!(builder.feed("<presence/>").is_empty());
    }

    #[test]
    fn mismatched_close_is_fatal() {
        let mut builder = StanzaBuilder::new();
        builder.feed(STREAM_HEADER);
        let events = builder.feed("<message><wrong></message>");

        assert!(events
            .iter()
            .any(|ev| matches!(ev, StreamEvent::StreamError(_))));
    }

    #[test]
    fn stream_close_emits_stream_end() {
        let mut builder = StanzaBuilder::new();
        builder.feed(STREAM_HEADER);
        let events = builder.feed("<presence/></stream:stream>");

        let prints = fingerprint(&events);
        assert_eq!(prints.len(), 2);
        assert!(prints[0].starts_with("stanza:"));
        assert_eq!(prints[1], "end");
    }

    #[test]
    fn chunk_splits_yield_identical_events() {
        let input = format!(
            "{STREAM_HEADER}<iq type='result' id='1'><bind \
             xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>u@d/r</jid></bind></iq>\
             <presence from='u@d/r'/></stream:stream>"
        );

        let mut whole = StanzaBuilder::new();
        let expected = fingerprint(&whole.feed(&input));
        assert!(expected.iter().any(|p| p.starts_with("stanza:")));

        for split in 1..input.len() {
            if !input.is_char_boundary(split) {
                continue;
            }
            let mut builder = StanzaBuilder::new();
            let mut events = builder.feed(&input[..split]);
            events.extend(builder.feed(&input[split..]));
            assert_eq!(
                fingerprint(&events),
                expected,
                "split at byte {split} diverged"
            );
        }
    }

    #[test]
    fn bosh_body_exposes_attrs_and_children() {
        let mut builder = StanzaBuilder::new();
        let events = builder.feed(
            "<body xmlns='http://jabber.org/protocol/httpbind' sid='abc' wait='60' \
             xmlns:stream='http://etherx.jabber.org/streams'>\
             <stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>\
             </stream:features></body>",
        );

        match &events[0] {
            StreamEvent::StreamStart { name, attrs } => {
                assert_eq!(name, "body");
                assert!(attrs.contains(&("sid".to_string(), "abc".to_string())));
            }
            other => panic!("expected StreamStart, got {other:?}"),
        }
        assert!(matches!(&events[1], StreamEvent::Stanza(el)
            if el.is("features", "http://etherx.jabber.org/streams")));
        assert!(matches!(&events[2], StreamEvent::StreamEnd));
    }

    #[test]
    fn reset_allows_a_fresh_stream() {
        let mut builder = StanzaBuilder::new();
        builder.feed(STREAM_HEADER);
        builder.feed("<presence/>");

        builder.reset();
        let events = builder.feed(STREAM_HEADER);
        assert!(matches!(&events[0], StreamEvent::StreamStart { .. }));
    }

    #[test]
    fn inter_stanza_whitespace_is_ignored() {
        let mut builder = StanzaBuilder::new();
        builder.feed(STREAM_HEADER);
        let events = builder.feed("<presence/> \n <presence/><presence/>");
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|ev| matches!(ev, StreamEvent::Stanza(_))));
    }
}
