//! Payload decoding and format detection.

use std::io::Read;

use flate2::read::GzDecoder;
use quick_xml::Reader;
use quick_xml::events::Event;
use wikiactivity_shared::{Result, SourceKind, WikiActivityError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const UTF8_BOM: [u8; 3] = [0xef, 0xbb, 0xbf];

/// Largest decoded payload [`crate::parse`] accepts (50 MiB).
pub const DEFAULT_MAX_DECODED_BYTES: u64 = 50 * 1024 * 1024;

/// Concrete document format of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    /// RSS 0.9x/2.0 or RSS 1.0 (RDF).
    Rss,
    Atom,
    /// `<urlset>` sitemap.
    Sitemap,
    /// `<sitemapindex>` pointing at further sitemaps.
    SitemapIndex,
}

impl SourceFormat {
    /// The source kind this format belongs to.
    pub const fn source_kind(&self) -> SourceKind {
        match self {
            Self::Rss | Self::Atom => SourceKind::Feed,
            Self::Sitemap | Self::SitemapIndex => SourceKind::Sitemap,
        }
    }

    /// Element name wrapping a single entry.
    pub(crate) const fn entry_element(&self) -> &'static str {
        match self {
            Self::Rss => "item",
            Self::Atom => "entry",
            Self::Sitemap => "url",
            Self::SitemapIndex => "sitemap",
        }
    }

    fn from_root(name: &str) -> Option<Self> {
        match name {
            "rss" | "rdf" | "channel" => Some(Self::Rss),
            "feed" => Some(Self::Atom),
            "urlset" => Some(Self::Sitemap),
            "sitemapindex" => Some(Self::SitemapIndex),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Rss => "rss",
            Self::Atom => "atom",
            Self::Sitemap => "sitemap",
            Self::SitemapIndex => "sitemap-index",
        };
        f.write_str(s)
    }
}

/// Inflate gzip payloads (`sitemap.xml.gz`) and strip a leading UTF-8 BOM.
///
/// Inflation stops with a parse error once the output passes `max_bytes`.
pub fn decode_payload(payload: Vec<u8>, max_bytes: u64) -> Result<Vec<u8>> {
    let mut bytes = if payload.starts_with(&GZIP_MAGIC) {
        let mut inflated = Vec::new();
        GzDecoder::new(payload.as_slice())
            .take(max_bytes.saturating_add(1))
            .read_to_end(&mut inflated)
            .map_err(|e| WikiActivityError::parse(format!("corrupt gzip payload: {e}")))?;
        if inflated.len() as u64 > max_bytes {
            return Err(WikiActivityError::parse(format!(
                "gzip payload inflates past {max_bytes} bytes"
            )));
        }
        inflated
    } else {
        payload
    };

    if bytes.starts_with(&UTF8_BOM) {
        bytes.drain(..UTF8_BOM.len());
    }
    Ok(bytes)
}

/// Identify the document format from its root element.
///
/// Fails when the payload has no root element or the root is not one of the
/// supported feed or sitemap roots (an HTML error page, for instance).
pub fn sniff(payload: &[u8]) -> Result<SourceFormat> {
    let mut reader = Reader::from_reader(payload);
    reader.config_mut().check_end_names = false;
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                return SourceFormat::from_root(&name).ok_or_else(|| {
                    WikiActivityError::parse(format!(
                        "unsupported document root <{name}>, expected a feed or sitemap"
                    ))
                });
            }
            Ok(Event::Eof) => {
                return Err(WikiActivityError::parse("payload contains no XML elements"));
            }
            Ok(_) => {}
            Err(e) => {
                return Err(WikiActivityError::parse(format!(
                    "payload is not XML: {e}"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn sniff_known_roots() {
        let cases = [
            (r#"<?xml version="1.0"?><rss version="2.0"><channel/></rss>"#, SourceFormat::Rss),
            (r#"<rdf:RDF xmlns:rdf="x"><item/></rdf:RDF>"#, SourceFormat::Rss),
            (r#"<feed xmlns="http://www.w3.org/2005/Atom"></feed>"#, SourceFormat::Atom),
            ("<!-- hi --><urlset></urlset>", SourceFormat::Sitemap),
            ("<sitemapindex></sitemapindex>", SourceFormat::SitemapIndex),
        ];
        for (xml, expected) in cases {
            assert_eq!(sniff(xml.as_bytes()).expect("sniff"), expected, "{xml}");
        }
    }

    #[test]
    fn sniff_rejects_html_and_empty() {
        let html = "<!DOCTYPE html><html><body>503 Service Unavailable</body></html>";
        assert!(matches!(sniff(html.as_bytes()), Err(WikiActivityError::Parse { .. })));
        assert!(sniff(b"").is_err());
        assert!(sniff(b"just some text").is_err());
    }

    #[test]
    fn decode_inflates_gzip_and_strips_bom() {
        let mut body = UTF8_BOM.to_vec();
        body.extend_from_slice(b"<urlset></urlset>");

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body).expect("write");
        let gz = encoder.finish().expect("finish");

        let decoded = decode_payload(gz, DEFAULT_MAX_DECODED_BYTES).expect("decode");
        assert_eq!(decoded, b"<urlset></urlset>");
    }

    #[test]
    fn decode_stops_inflating_at_the_limit() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&vec![b' '; 4 * 1024 * 1024]).expect("write");
        let gz = encoder.finish().expect("finish");
        assert!(gz.len() < 64 * 1024);

        let err = decode_payload(gz.clone(), 1024 * 1024).expect_err("over the limit");
        assert!(matches!(err, WikiActivityError::Parse { .. }));
        assert_eq!(decode_payload(gz, 4 * 1024 * 1024).expect("at the limit").len(), 4 * 1024 * 1024);
    }

    #[test]
    fn decode_rejects_truncated_gzip() {
        let truncated = vec![0x1f, 0x8b, 0x08, 0x00];
        assert!(decode_payload(truncated, DEFAULT_MAX_DECODED_BYTES).is_err());
    }

    #[test]
    fn formats_map_to_source_kinds() {
        assert_eq!(SourceFormat::Atom.source_kind(), SourceKind::Feed);
        assert_eq!(SourceFormat::SitemapIndex.source_kind(), SourceKind::Sitemap);
    }
}
