//! Raw source parsing for wiki activity feeds and sitemaps.
//!
//! This crate provides:
//! - [`parse`]: turns a fetched payload into a lazy [`SourceStream`] of [`RawEntry`] values
//! - [`parse_with_limit`]: the same with a cap on the decoded size
//! - [`sniff`] / [`decode_payload`]: format detection and gzip/BOM handling
//!
//! Third-party feeds are frequently not well-formed XML. Damage is confined to
//! the entry it occurs in: such entries are re-read with an HTML tag-soup
//! parser, and entries that still yield no link are skipped with an
//! [`EntryRecoveryWarning`]. Only a payload with no recognizable feed or
//! sitemap root is an error.

mod fields;
pub mod format;
mod reader;
mod soup;
mod xml;

use serde::Serialize;
use tracing::{info, warn};
use wikiactivity_shared::{RawEntry, Result, SourceKind, WikiActivityError};

pub use format::{DEFAULT_MAX_DECODED_BYTES, SourceFormat, decode_payload, sniff};
use reader::{EntryReader, Step};

/// Detailed warnings kept per stream; later ones are only counted.
const MAX_RETAINED_WARNINGS: usize = 256;

/// Counters for one parsed payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    /// Entries handed downstream (recovered ones included).
    pub emitted: usize,
    /// Entries dropped because nothing usable could be recovered.
    pub skipped: usize,
    /// Entries emitted only thanks to tag-soup recovery.
    pub recovered: usize,
}

/// A malformed entry that was either skipped or recovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryRecoveryWarning {
    pub site_id: String,
    pub source_kind: SourceKind,
    /// Byte offset of the entry in the decoded payload.
    pub offset: usize,
    pub reason: String,
    /// Whether an entry was still emitted.
    pub recovered: bool,
}

/// Parse a payload into a lazy stream of raw entries.
///
/// The payload may be gzip-compressed. Fails with a parse error only when it
/// is not recognizable as a feed or sitemap at all, or when its format does
/// not match `source_kind`.
pub fn parse(payload: Vec<u8>, source_kind: SourceKind, site_id: &str) -> Result<SourceStream> {
    parse_with_limit(payload, source_kind, site_id, DEFAULT_MAX_DECODED_BYTES)
}

/// [`parse`] with an explicit cap on the decoded payload size.
pub fn parse_with_limit(
    payload: Vec<u8>,
    source_kind: SourceKind,
    site_id: &str,
    max_decoded_bytes: u64,
) -> Result<SourceStream> {
    let payload = decode_payload(payload, max_decoded_bytes)?;
    let format = sniff(&payload)?;
    if format.source_kind() != source_kind {
        return Err(WikiActivityError::parse(format!(
            "expected a {source_kind} payload for site {site_id}, found {format}"
        )));
    }

    Ok(SourceStream {
        reader: EntryReader::new(payload, format, site_id),
        format,
        site_id: site_id.to_string(),
        stats: ParseStats::default(),
        warnings: Vec::new(),
        nested: Vec::new(),
        finished: false,
    })
}

/// Lazily parsed entries of one payload.
///
/// Statistics, warnings and nested sitemap URLs accumulate as the stream is
/// consumed; they are complete once the iterator returns `None`.
pub struct SourceStream {
    reader: EntryReader,
    format: SourceFormat,
    site_id: String,
    stats: ParseStats,
    warnings: Vec<EntryRecoveryWarning>,
    nested: Vec<String>,
    finished: bool,
}

impl SourceStream {
    pub fn format(&self) -> SourceFormat {
        self.format
    }

    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    pub fn warnings(&self) -> &[EntryRecoveryWarning] {
        &self.warnings
    }

    /// Sitemap URLs listed by a sitemap index.
    pub fn nested_sitemaps(&self) -> &[String] {
        &self.nested
    }

    fn record_warning(&mut self, offset: usize, reason: String, recovered: bool) {
        if self.warnings.len() < MAX_RETAINED_WARNINGS {
            self.warnings.push(EntryRecoveryWarning {
                site_id: self.site_id.clone(),
                source_kind: self.format.source_kind(),
                offset,
                reason,
                recovered,
            });
        }
    }
}

impl Iterator for SourceStream {
    type Item = RawEntry;

    fn next(&mut self) -> Option<RawEntry> {
        loop {
            match self.reader.next_step() {
                Some(Step::Page { entry, recovered }) => {
                    self.stats.emitted += 1;
                    if let Some(recovery) = recovered {
                        self.stats.recovered += 1;
                        self.record_warning(recovery.offset, recovery.reason, true);
                    }
                    return Some(entry);
                }
                Some(Step::Skipped(recovery)) => {
                    self.stats.skipped += 1;
                    warn!(
                        site = %self.site_id,
                        format = %self.format,
                        offset = recovery.offset,
                        reason = %recovery.reason,
                        "skipping malformed entry"
                    );
                    self.record_warning(recovery.offset, recovery.reason, false);
                }
                Some(Step::Nested(url)) => self.nested.push(url),
                None => {
                    if !self.finished {
                        self.finished = true;
                        info!(
                            site = %self.site_id,
                            format = %self.format,
                            emitted = self.stats.emitted,
                            skipped = self.stats.skipped,
                            recovered = self.stats.recovered,
                            nested = self.nested.len(),
                            "payload parsed"
                        );
                    }
                    return None;
                }
            }
        }
    }
}
