//! Error types for wikiactivity.
//!
//! Library crates use [`WikiActivityError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Per-entry problems (a skipped feed item, a backward timestamp move) are
//! reported as values by the crates that detect them, not through this type.

use std::path::PathBuf;

/// Top-level error type for all wikiactivity operations.
#[derive(Debug, thiserror::Error)]
pub enum WikiActivityError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A source could not be fetched; the site is skipped for this cycle.
    #[error("fetch error for {url}: {message}")]
    Fetch { url: String, message: String },

    /// Payload is not recognizable as any supported source format.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// An entry URL could not be resolved to a page of its site.
    #[error("normalization error for {url}: {reason}")]
    Normalization { url: String, reason: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invariant violation on reload, bad input, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, WikiActivityError>;

impl WikiActivityError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a fetch error for `url`.
    pub fn fetch(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error should abort the whole run rather than one site.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = WikiActivityError::config("no sites configured");
        assert_eq!(err.to_string(), "config error: no sites configured");

        let err = WikiActivityError::fetch("https://scp-wiki.wikidot.com/feed", "HTTP 503");
        assert!(err.to_string().contains("HTTP 503"));
        assert!(err.to_string().contains("scp-wiki"));
    }

    #[test]
    fn only_store_and_config_faults_are_fatal() {
        assert!(WikiActivityError::Storage("disk full".into()).is_fatal());
        assert!(!WikiActivityError::parse("not xml").is_fatal());
        assert!(!WikiActivityError::fetch("u", "timeout").is_fatal());
    }
}
