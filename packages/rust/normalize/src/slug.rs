//! URL to page slug canonicalization.

use url::Url;
use wikiactivity_shared::Site;

use crate::NormalizationError;

/// Resolve `raw_url` against the site and return the page slug.
///
/// Relative URLs are resolved against the site's base URL. The slug is the
/// path below the base path with query and fragment dropped, percent-decoded,
/// duplicate separators collapsed and surrounding slashes trimmed. Case is
/// preserved. A URL on another host is rejected; `http` and `https` are
/// treated as the same site.
pub fn page_slug(raw_url: &str, site: &Site) -> Result<String, NormalizationError> {
    let trimmed = raw_url.trim();
    let url = site
        .base_url
        .join(trimmed)
        .map_err(|e| NormalizationError::InvalidUrl {
            url: trimmed.to_string(),
            reason: e.to_string(),
        })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(NormalizationError::InvalidUrl {
            url: trimmed.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }

    if !same_site(&url, &site.base_url) {
        return Err(NormalizationError::ForeignHost {
            url: trimmed.to_string(),
            host: url.host_str().unwrap_or_default().to_string(),
            expected: site.base_url.host_str().unwrap_or_default().to_string(),
        });
    }

    let path = collapse_slashes(url.path());
    let base = collapse_slashes(site.base_url.path());
    let Some(rest) = path.strip_prefix(base.as_str()) else {
        return Err(NormalizationError::OutsideBase {
            url: trimmed.to_string(),
            base: base.clone(),
        });
    };

    let decoded = match urlencoding::decode(rest) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(rest.as_bytes())).into_owned(),
    };
    let slug = collapse_slashes(&decoded).trim_matches('/').to_string();

    if slug.is_empty() {
        return Err(NormalizationError::EmptySlug {
            url: trimmed.to_string(),
        });
    }
    Ok(slug)
}

fn same_site(url: &Url, base: &Url) -> bool {
    match (url.host_str(), base.host_str()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b) && url.port() == base.port(),
        _ => false,
    }
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    out
}
