//! Incremental XML tokenization.
//!
//! Wraps `quick_xml::Reader` so a chunk-fed byte stream can be turned into
//! tag/text tokens without ever splitting a token across two `drain` calls.
//! Partial input at the end of the buffer (an unclosed tag, or a text run
//! that may still grow) stays buffered until more data arrives, which is
//! what gives the stanza builder its chunk-boundary independence.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::ConnectionError;

/// One resolved lexical token. Names are the raw qualified names as they
/// appear on the wire; prefix resolution happens in the scope chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawToken {
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close {
        name: String,
    },
    Text(String),
}

/// Buffered, restartable token source.
#[derive(Debug, Default)]
pub struct TokenStream {
    buf: String,
}

impl TokenStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of stream input.
    pub fn write(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
    }

    /// Discard all buffered input. Used on SASL stream restarts.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Produce every complete token currently in the buffer.
    ///
    /// A trailing partial tag or trailing text run is left in place for
    /// the next call; a malformed document is a fatal error (XMPP streams
    /// are not resumable mid-parse).
    pub fn drain(&mut self) -> Result<Vec<RawToken>, ConnectionError> {
        let mut tokens = Vec::new();
        let mut consumed = 0usize;

        {
            let mut reader = Reader::from_str(&self.buf);
            reader.config_mut().check_end_names = false;
            // Earlier drains may already have consumed an element's open
            // tag, so a close tag can legitimately lead the buffer. The
            // stanza builder does its own open/close matching.
            reader.config_mut().allow_unmatched_ends = true;

            loop {
                match reader.read_event() {
                    Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_))
                    | Ok(Event::DocType(_)) => {
                        consumed = reader.buffer_position() as usize;
                    }
                    Ok(Event::Start(e)) => {
                        tokens.push(RawToken::Open {
                            name: qname(&e),
                            attrs: parse_attrs(&e)?,
                            self_closing: false,
                        });
                        consumed = reader.buffer_position() as usize;
                    }
                    Ok(Event::Empty(e)) => {
                        tokens.push(RawToken::Open {
                            name: qname(&e),
                            attrs: parse_attrs(&e)?,
                            self_closing: true,
                        });
                        consumed = reader.buffer_position() as usize;
                    }
                    Ok(Event::End(e)) => {
                        tokens.push(RawToken::Close {
                            name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
                        });
                        consumed = reader.buffer_position() as usize;
                    }
                    Ok(Event::Text(e)) => {
                        let after = reader.buffer_position() as usize;
                        if after >= self.buf.len() {
                            // The run may continue in the next chunk.
                            break;
                        }
                        let value = e.unescape().map_err(|err| {
                            ConnectionError::XmlError(format!("bad character data: {err}"))
                        })?;
                        tokens.push(RawToken::Text(value.into_owned()));
                        consumed = after;
                    }
                    Ok(Event::CData(e)) => {
                        tokens.push(RawToken::Text(
                            String::from_utf8_lossy(e.as_ref()).into_owned(),
                        ));
                        consumed = reader.buffer_position() as usize;
                    }
                    Ok(Event::Eof) => break,
                    Err(quick_xml::Error::Syntax(
                        SyntaxError::UnclosedTag
                        | SyntaxError::UnclosedCData
                        | SyntaxError::UnclosedComment
                        | SyntaxError::UnclosedDoctype
                        | SyntaxError::UnclosedPIOrXmlDecl,
                    )) => {
                        // Partial input at the buffer end; wait for more.
                        break;
                    }
                    Err(err) => {
                        return Err(ConnectionError::XmlError(err.to_string()));
                    }
                }
            }
        }

        self.buf.drain(..consumed);
        Ok(tokens)
    }
}

fn qname(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn parse_attrs(e: &BytesStart) -> Result<Vec<(String, String)>, ConnectionError> {
    let mut attrs = Vec::new();
    for attr in e.attributes() {
        let attr =
            attr.map_err(|err| ConnectionError::XmlError(format!("bad attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| ConnectionError::XmlError(format!("bad attribute value: {err}")))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(attrs)
}
