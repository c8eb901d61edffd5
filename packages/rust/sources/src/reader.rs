//! Incremental entry reader.
//!
//! Pulls one entry at a time off the XML event stream. Entries that read
//! cleanly are mapped directly; entries with mismatched or unclosed tags or
//! undecodable character references are re-read from their raw bytes by the
//! tag-soup parser. After a syntax error the XML reader cannot continue past,
//! the rest of the document is cut at entry start tags and each piece is read
//! again on its own: strictly first, as tag soup only if that fails too.

use std::collections::VecDeque;

use tracing::warn;
use wikiactivity_shared::RawEntry;

use crate::fields::{Built, Field, build, element_name};
use crate::format::SourceFormat;
use crate::soup;
use crate::xml::{XmlCursor, XmlEvent};

/// Where and why an entry needed recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Recovery {
    pub offset: usize,
    pub reason: String,
}

/// Outcome of reading one entry.
#[derive(Debug)]
pub(crate) enum Step {
    Page {
        entry: RawEntry,
        recovered: Option<Recovery>,
    },
    Skipped(Recovery),
    Nested(String),
}

impl Step {
    /// Move recovery offsets by `base` bytes.
    fn shifted(self, base: usize) -> Self {
        match self {
            Self::Page {
                entry,
                recovered: Some(r),
            } => Self::Page {
                entry,
                recovered: Some(Recovery {
                    offset: r.offset + base,
                    reason: r.reason,
                }),
            },
            Self::Skipped(r) => Self::Skipped(Recovery {
                offset: r.offset + base,
                reason: r.reason,
            }),
            other => other,
        }
    }
}

/// Elements that enclose entries; closing one ends any open entry.
const CONTAINERS: [&str; 6] = ["channel", "rss", "rdf", "feed", "urlset", "sitemapindex"];

struct Open {
    name: String,
    attrs: Vec<(String, String)>,
    text: String,
}

pub(crate) struct EntryReader {
    format: SourceFormat,
    site_id: String,
    cursor: XmlCursor,
    /// Steps already produced by tag-soup recovery.
    pending: VecDeque<Step>,
    /// Start of an entry that interrupted the previous one.
    interrupted: Option<(usize, Vec<(String, String)>)>,
    done: bool,
    /// Stop at a syntax error instead of recovering; sets `failed`.
    strict: bool,
    failed: bool,
}

impl EntryReader {
    pub(crate) fn new(payload: Vec<u8>, format: SourceFormat, site_id: &str) -> Self {
        Self {
            format,
            site_id: site_id.to_string(),
            cursor: XmlCursor::new(payload),
            pending: VecDeque::new(),
            interrupted: None,
            done: false,
            strict: false,
            failed: false,
        }
    }

    pub(crate) fn next_step(&mut self) -> Option<Step> {
        loop {
            if let Some(step) = self.pending.pop_front() {
                return Some(step);
            }
            if self.done {
                return None;
            }
            let start = match self.interrupted.take() {
                Some(start) => Some(start),
                None => self.seek_entry(),
            };
            if let Some((offset, attrs)) = start {
                if let Some(step) = self.read_entry(offset, attrs) {
                    return Some(step);
                }
            }
        }
    }

    /// Advance to the next entry start tag.
    fn seek_entry(&mut self) -> Option<(usize, Vec<(String, String)>)> {
        let entry = self.format.entry_element();
        loop {
            let before = self.cursor.position();
            match self.cursor.next_event() {
                Ok(XmlEvent::Start { name, attrs }) if element_name(&name) == entry => {
                    return Some((before, attrs));
                }
                Ok(XmlEvent::Empty { name, .. }) if element_name(&name) == entry => {
                    self.pending.push_back(Step::Skipped(Recovery {
                        offset: before,
                        reason: format!("empty <{entry}/>"),
                    }));
                    return None;
                }
                Ok(XmlEvent::Eof) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.fall_back(before, &e);
                    return None;
                }
            }
        }
    }

    /// Read one entry whose start tag began at `start`.
    fn read_entry(&mut self, start: usize, attrs: Vec<(String, String)>) -> Option<Step> {
        let entry = self.format.entry_element();
        let mut stack = vec![Open {
            name: entry.to_string(),
            attrs,
            text: String::new(),
        }];
        let mut fields = Vec::new();
        let mut damage: Option<String> = None;

        loop {
            let before = self.cursor.position();
            let event = match self.cursor.next_event() {
                Ok(event) => event,
                Err(e) => {
                    self.fall_back(start, &e);
                    return None;
                }
            };

            match event {
                XmlEvent::Start { name, attrs } => {
                    let name = element_name(&name);
                    if name == entry {
                        damage.get_or_insert_with(|| format!("<{entry}> not closed"));
                        self.interrupted = Some((before, attrs));
                        close_children(&mut stack, &mut fields);
                        return Some(self.finish(start, before, &fields, damage));
                    }
                    stack.push(Open {
                        name,
                        attrs,
                        text: String::new(),
                    });
                }
                XmlEvent::Empty { name, attrs } => {
                    fields.push(Field {
                        name: element_name(&name),
                        parent: stack.last().map(|o| o.name.clone()).unwrap_or_default(),
                        attrs,
                        text: String::new(),
                    });
                }
                XmlEvent::Text { text, escape_error } => {
                    if let Some(err) = escape_error {
                        damage.get_or_insert_with(|| format!("bad character reference: {err}"));
                    }
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&text);
                    }
                }
                XmlEvent::End { name } => {
                    let name = element_name(&name);
                    match stack.iter().rposition(|o| o.name == name) {
                        Some(0) => {
                            if stack.len() > 1 {
                                damage.get_or_insert_with(|| format!("unclosed elements in <{entry}>"));
                                close_children(&mut stack, &mut fields);
                            }
                            let end = self.cursor.position();
                            return Some(self.finish(start, end, &fields, damage));
                        }
                        Some(idx) => {
                            if idx + 1 != stack.len() {
                                damage.get_or_insert_with(|| format!("mismatched </{name}>"));
                            }
                            while stack.len() > idx {
                                pop_field(&mut stack, &mut fields);
                            }
                        }
                        None if CONTAINERS.contains(&name.as_str()) => {
                            damage.get_or_insert_with(|| format!("<{entry}> not closed"));
                            close_children(&mut stack, &mut fields);
                            return Some(self.finish(start, before, &fields, damage));
                        }
                        None => {
                            damage.get_or_insert_with(|| format!("unexpected </{name}>"));
                        }
                    }
                }
                XmlEvent::Eof => {
                    self.done = true;
                    damage.get_or_insert_with(|| format!("document ends inside <{entry}>"));
                    close_children(&mut stack, &mut fields);
                    let end = self.cursor.position();
                    return Some(self.finish(start, end, &fields, damage));
                }
                XmlEvent::Other => {}
            }
        }
    }

    fn finish(&self, start: usize, end: usize, fields: &[Field], damage: Option<String>) -> Step {
        let Some(reason) = damage else {
            return self.step_from(build(self.format, &self.site_id, fields), None, start);
        };

        let markup = self.cursor.slice(start, end);
        match soup::recover_entries(&markup, self.format).into_iter().next() {
            Some(recovered) => {
                let built = build(self.format, &self.site_id, &recovered);
                self.step_from(built, Some(reason), start)
            }
            None => Step::Skipped(Recovery {
                offset: start,
                reason,
            }),
        }
    }

    fn step_from(
        &self,
        built: std::result::Result<Built, String>,
        damage: Option<String>,
        offset: usize,
    ) -> Step {
        match (built, damage) {
            (Ok(Built::Page(entry)), damage) => Step::Page {
                entry,
                recovered: damage.map(|reason| Recovery { offset, reason }),
            },
            (Ok(Built::Nested(url)), _) => Step::Nested(url),
            (Err(why), None) => Step::Skipped(Recovery {
                offset,
                reason: why,
            }),
            (Err(why), Some(damage)) => Step::Skipped(Recovery {
                offset,
                reason: format!("{damage}; {why}"),
            }),
        }
    }

    /// Re-read everything from `offset` one entry at a time.
    fn fall_back(&mut self, offset: usize, err: &str) {
        self.done = true;
        if self.strict {
            self.failed = true;
            return;
        }
        warn!(
            site = %self.site_id,
            format = %self.format,
            offset,
            error = err,
            "XML reader failed, re-reading remainder entry by entry"
        );

        let markup = self.cursor.remainder_from(offset);
        let reason = format!("XML syntax error {err}");
        let starts = entry_starts(&markup, self.format.entry_element());
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(markup.len());
            let chunk = &markup[start..end];
            let base = offset + start;

            if let Some(steps) = self.read_strict(chunk) {
                self.pending.extend(steps.into_iter().map(|step| step.shifted(base)));
                continue;
            }
            let recovered = soup::recover_entries(chunk, self.format);
            if recovered.is_empty() {
                self.pending.push_back(Step::Skipped(Recovery {
                    offset: base,
                    reason: reason.clone(),
                }));
            }
            for fields in recovered {
                let built = build(self.format, &self.site_id, &fields);
                let step = self.step_from(built, Some(reason.clone()), base);
                self.pending.push_back(step);
            }
        }
    }

    /// Read `chunk` with a fresh strict reader; `None` if it hits a syntax error.
    fn read_strict(&self, chunk: &str) -> Option<Vec<Step>> {
        let mut reader = EntryReader::new(chunk.as_bytes().to_vec(), self.format, &self.site_id);
        reader.strict = true;
        let steps: Vec<_> = std::iter::from_fn(|| reader.next_step()).collect();
        (!reader.failed).then_some(steps)
    }
}

/// Byte offsets of every `<entry` start tag in `markup`, namespace prefixes allowed.
fn entry_starts(markup: &str, entry: &str) -> Vec<usize> {
    markup
        .match_indices('<')
        .map(|(i, _)| i)
        .filter(|&i| {
            let rest = &markup[i + 1..];
            let len = rest
                .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
                .unwrap_or(rest.len());
            len > 0 && element_name(&rest[..len]) == entry
        })
        .collect()
}

fn pop_field(stack: &mut Vec<Open>, fields: &mut Vec<Field>) {
    if let Some(open) = stack.pop() {
        fields.push(Field {
            name: open.name,
            parent: stack.last().map(|o| o.name.clone()).unwrap_or_default(),
            attrs: open.attrs,
            text: open.text,
        });
    }
}

/// Close everything above the entry element itself.
fn close_children(stack: &mut Vec<Open>, fields: &mut Vec<Field>) {
    while stack.len() > 1 {
        pop_field(stack, fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(xml: &str, format: SourceFormat) -> Vec<Step> {
        let mut reader = EntryReader::new(xml.as_bytes().to_vec(), format, "test");
        std::iter::from_fn(|| reader.next_step()).collect()
    }

    #[test]
    fn clean_entries_need_no_recovery() {
        let xml = r#"<rss><channel><title>Site</title>
            <item><title>A</title><link>http://x/a</link></item>
            <item><title>B</title><link>http://x/b</link></item>
            </channel></rss>"#;
        let steps = steps(xml, SourceFormat::Rss);
        assert_eq!(steps.len(), 2);
        for step in &steps {
            assert!(matches!(step, Step::Page { recovered: None, .. }));
        }
    }

    #[test]
    fn channel_title_is_not_an_entry_field() {
        let xml = "<rss><channel><title>Site</title><item><link>http://x/a</link></item></channel></rss>";
        match &steps(xml, SourceFormat::Rss)[0] {
            Step::Page { entry, .. } => assert_eq!(entry.raw_title, None),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn mismatched_tag_is_recovered_within_entry() {
        let xml = r#"<feed>
            <entry><title>A</title><summary>x</sumary><link href="http://x/a"/></entry>
            <entry><title>B</title><link href="http://x/b"/></entry>
            </feed>"#;
        let steps = steps(xml, SourceFormat::Atom);
        assert_eq!(steps.len(), 2);
        match &steps[0] {
            Step::Page { entry, recovered } => {
                assert_eq!(entry.raw_url, "http://x/a");
                assert!(recovered.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&steps[1], Step::Page { recovered: None, .. }));
    }

    #[test]
    fn unclosed_entry_does_not_swallow_the_next() {
        let xml = r#"<feed>
            <entry><title>A</title><link href="http://x/a"/>
            <entry><title>B</title><link href="http://x/b"/></entry>
            </feed>"#;
        let urls: Vec<_> = steps(xml, SourceFormat::Atom)
            .into_iter()
            .filter_map(|s| match s {
                Step::Page { entry, .. } => Some(entry.raw_url),
                _ => None,
            })
            .collect();
        assert_eq!(urls, vec!["http://x/a", "http://x/b"]);
    }

    #[test]
    fn truncated_document_keeps_earlier_entries() {
        let xml = "<urlset><url><loc>http://x/a</loc></url><url><loc>http://x/b</loc>";
        let steps = steps(xml, SourceFormat::Sitemap);
        assert_eq!(steps.len(), 2);
        assert!(matches!(&steps[0], Step::Page { recovered: None, .. }));
        match &steps[1] {
            Step::Page { entry, recovered } => {
                assert_eq!(entry.raw_url, "http://x/b");
                assert!(recovered.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn entries_after_a_syntax_error_are_read_strictly() {
        let xml = r#"<rss><channel>
            <item><title>A</title><link>http://x/a</link></item>
            <item><title>B <!x> oops</title><link>http://x/b</link></item>
            <item><title>C</title><link>http://x/c</link></item>
            <rdf:item><title>D</title><link>http://x/d</link></rdf:item>
            </channel></rss>"#;
        let steps = steps(xml, SourceFormat::Rss);
        assert_eq!(steps.len(), 4);
        assert!(matches!(&steps[1], Step::Skipped(r) if r.reason.starts_with("XML syntax error")));

        let clean: Vec<_> = steps
            .iter()
            .filter_map(|s| match s {
                Step::Page { entry, recovered: None } => Some(entry.raw_url.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(clean, vec!["http://x/a", "http://x/c", "http://x/d"]);
    }

    #[test]
    fn syntax_error_offsets_point_into_the_payload() {
        let xml = "<urlset><url><loc>http://x/a</loc></url><url><loc>http://x/b<!x></loc></url></urlset>";
        let steps = steps(xml, SourceFormat::Sitemap);
        let offset = steps
            .iter()
            .find_map(|s| match s {
                Step::Page { recovered: Some(r), .. } | Step::Skipped(r) => Some(r.offset),
                _ => None,
            })
            .expect("damaged entry");
        assert_eq!(offset, xml.find("<url><loc>http://x/b").expect("second url"));
    }

    #[test]
    fn entry_starts_accept_prefixes_only_on_the_entry_name() {
        let markup = "<item>a</item><items/><rdf:item x=\"1\"></rdf:item></item><item";
        assert_eq!(entry_starts(markup, "item"), vec![0, 22, 56]);
    }

    #[test]
    fn empty_entry_is_skipped() {
        let steps = steps("<urlset><url/></urlset>", SourceFormat::Sitemap);
        assert!(matches!(&steps[..], [Step::Skipped(_)]));
    }
}
