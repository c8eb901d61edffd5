//! Thin owned-event wrapper around `quick-xml`'s streaming reader.
//!
//! The reader runs with end-name checking disabled: mismatched tags are
//! reported to the caller as ordinary `End` events so that damage can be
//! confined to the entry it occurs in instead of aborting the document.
//! Stray end tags with nothing open are passed through the same way.

use std::io::Cursor;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

/// An XML event with all borrowed data copied out of the read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum XmlEvent {
    Start {
        name: String,
        attrs: Vec<(String, String)>,
    },
    Empty {
        name: String,
        attrs: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    /// Character data. `escape_error` is set when the raw text contained an
    /// entity that could not be decoded; `text` then holds the raw bytes.
    Text {
        text: String,
        escape_error: Option<String>,
    },
    Eof,
    /// Declarations, comments, processing instructions.
    Other,
}

/// Streaming cursor over an owned payload.
pub(crate) struct XmlCursor {
    reader: Reader<Cursor<Vec<u8>>>,
    buf: Vec<u8>,
}

impl XmlCursor {
    pub(crate) fn new(payload: Vec<u8>) -> Self {
        let mut reader = Reader::from_reader(Cursor::new(payload));
        let config = reader.config_mut();
        config.check_end_names = false;
        config.allow_unmatched_ends = true;
        config.trim_text(false);
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Byte offset of the next unread event.
    pub(crate) fn position(&self) -> usize {
        self.reader.buffer_position() as usize
    }

    /// The payload text from `pos` to the end, decoded lossily.
    pub(crate) fn remainder_from(&self, pos: usize) -> String {
        let bytes = self.reader.get_ref().get_ref();
        let start = pos.min(bytes.len());
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }

    /// The payload text between two offsets, decoded lossily.
    pub(crate) fn slice(&self, start: usize, end: usize) -> String {
        let bytes = self.reader.get_ref().get_ref();
        let end = end.min(bytes.len());
        let start = start.min(end);
        String::from_utf8_lossy(&bytes[start..end]).into_owned()
    }

    /// Read the next event. An `Err` means the reader hit a syntax error it
    /// cannot continue past.
    pub(crate) fn next_event(&mut self) -> Result<XmlEvent, String> {
        self.buf.clear();
        let event = match self.reader.read_event_into(&mut self.buf) {
            Ok(Event::Start(e)) => XmlEvent::Start {
                name: local_name(&e),
                attrs: attributes(&e),
            },
            Ok(Event::Empty(e)) => XmlEvent::Empty {
                name: local_name(&e),
                attrs: attributes(&e),
            },
            Ok(Event::End(e)) => XmlEvent::End {
                name: String::from_utf8_lossy(e.local_name().as_ref()).into_owned(),
            },
            Ok(Event::Text(e)) => match e.unescape() {
                Ok(text) => XmlEvent::Text {
                    text: text.into_owned(),
                    escape_error: None,
                },
                Err(err) => XmlEvent::Text {
                    text: String::from_utf8_lossy(&e).into_owned(),
                    escape_error: Some(err.to_string()),
                },
            },
            Ok(Event::CData(e)) => XmlEvent::Text {
                text: String::from_utf8_lossy(&e).into_owned(),
                escape_error: None,
            },
            Ok(Event::Eof) => XmlEvent::Eof,
            Ok(_) => XmlEvent::Other,
            Err(e) => return Err(format!("at byte {}: {e}", self.reader.error_position())),
        };
        Ok(event)
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attributes(e: &BytesStart<'_>) -> Vec<(String, String)> {
    e.attributes()
        .flatten()
        .map(|attr| {
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = match attr.unescape_value() {
                Ok(v) => v.into_owned(),
                Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
            };
            (key, value)
        })
        .collect()
}

/// Look up an attribute value by local name.
pub(crate) fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(xml: &str) -> Vec<XmlEvent> {
        let mut cursor = XmlCursor::new(xml.as_bytes().to_vec());
        let mut out = Vec::new();
        loop {
            match cursor.next_event().expect("event") {
                XmlEvent::Eof => break,
                XmlEvent::Other => {}
                ev => out.push(ev),
            }
        }
        out
    }

    #[test]
    fn namespaced_names_use_local_part() {
        let evs = events(r#"<rss><dc:date>2024</dc:date><atom:link href="x"/></rss>"#);
        assert!(evs.contains(&XmlEvent::Start {
            name: "date".into(),
            attrs: vec![]
        }));
        assert!(evs.iter().any(|e| matches!(e, XmlEvent::Empty { name, attrs }
            if name == "link" && attr(attrs, "href") == Some("x"))));
    }

    #[test]
    fn bad_entity_is_reported_not_fatal() {
        let evs = events("<t>Tom & Jerry</t>");
        match &evs[1] {
            XmlEvent::Text { text, escape_error } => {
                assert_eq!(text, "Tom & Jerry");
                assert!(escape_error.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn mismatched_end_names_pass_through() {
        let evs = events("<a><b>x</c></a>");
        assert!(evs.contains(&XmlEvent::End { name: "c".into() }));
    }

    #[test]
    fn unmatched_end_tags_pass_through() {
        let evs = events("<item>x</item></channel></rss>");
        assert!(evs.contains(&XmlEvent::End { name: "channel".into() }));
        assert!(evs.contains(&XmlEvent::End { name: "rss".into() }));
    }
}
