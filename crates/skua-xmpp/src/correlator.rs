//! IQ request/response correlation.
//!
//! Each outbound request registers a oneshot completion keyed by stanza id.
//! The first matching `result`/`error` IQ completes it; later duplicates
//! and unmatched ids are left to the normal stanza routing. Entries never
//! expire on their own, so an unanswered request waits until the session
//! closes.

use std::collections::HashMap;

use minidom::Element;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::debug;

use crate::ns;

#[derive(Default)]
pub struct IqCorrelator {
    pending: HashMap<String, oneshot::Sender<Element>>,
}

impl IqCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure the stanza carries an id, generating one if absent.
    pub fn ensure_id(stanza: &mut Element) -> String {
        if let Some(id) = stanza.attr("id") {
            return id.to_string();
        }
        let id: String = rand::rng()
            .sample_iter(Alphanumeric)
            .take(9)
            .map(char::from)
            .collect();
        stanza.set_attr("id", id.as_str());
        id
    }

    /// Register interest in the response to `id`. A second registration for
    /// the same id replaces the first, dropping its receiver.
    pub fn register(&mut self, id: String) -> oneshot::Receiver<Element> {
        let (tx, rx) = oneshot::channel();
        self.register_sender(id, tx);
        rx
    }

    /// Register an externally created completion sender for `id`.
    pub fn register_sender(&mut self, id: String, sender: oneshot::Sender<Element>) {
        self.pending.insert(id, sender);
    }

    /// Complete a pending request if this stanza is a matching `result` or
    /// `error` IQ. Returns whether the stanza was consumed.
    pub fn complete(&mut self, stanza: &Element) -> bool {
        if !stanza.is("iq", ns::CLIENT) {
            return false;
        }
        if !matches!(stanza.attr("type"), Some("result") | Some("error")) {
            return false;
        }
        let Some(id) = stanza.attr("id") else {
            return false;
        };

        match self.pending.remove(id) {
            Some(sender) => {
                // The requester may have gone away; that only means nobody
                // is listening anymore.
                let _ = sender.send(stanza.clone());
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every pending completion. Awaiting callers observe a closed
    /// channel.
    pub fn close(&mut self) {
        if !self.pending.is_empty() {
            debug!(pending = self.pending.len(), "dropping unanswered IQ requests");
        }
        self.pending.clear();
    }
}
