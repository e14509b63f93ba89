//! Caller origins.
//!
//! An [`Origin`] is the identity of the calling context. It is derived by
//! the channel from its own context (a WebSocket `Origin` header, the caller
//! argument handed to a native host, the identity of an in-process caller)
//! and never read from a request payload.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Normalized `scheme://host[:port]` origin.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Origin(String);

/// Error returned for strings that are not origins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid origin: {0:?}")]
pub struct InvalidOrigin(pub String);

impl Origin {
    /// Parse and normalize an origin.
    ///
    /// Scheme and host are lowercased and a single trailing `/` is dropped
    /// (native hosts receive `chrome-extension://<id>/`). Paths, queries,
    /// fragments, and the opaque `null` origin are rejected.
    pub fn parse(raw: &str) -> Result<Self, InvalidOrigin> {
        let trimmed = raw.trim();
        let without_slash = trimmed.strip_suffix('/').unwrap_or(trimmed);
        let invalid = || InvalidOrigin(raw.to_owned());

        let (scheme, rest) = without_slash.split_once("://").ok_or_else(invalid)?;
        let scheme_ok = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        let host_ok = !rest.is_empty()
            && !rest.contains(['/', '?', '#', ' ', '@'])
            && !rest.starts_with(':');
        if !scheme_ok || !host_ok {
            return Err(invalid());
        }
        Ok(Self(format!(
            "{}://{}",
            scheme.to_ascii_lowercase(),
            rest.to_ascii_lowercase()
        )))
    }

    /// Return the origin as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Origin {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_web_origin() {
        let o = Origin::parse("https://a.example").unwrap();
        assert_eq!(o.as_str(), "https://a.example");
    }

    #[test]
    fn normalizes_case_and_trailing_slash() {
        let o = Origin::parse("HTTPS://A.Example:8443/").unwrap();
        assert_eq!(o.as_str(), "https://a.example:8443");
    }

    #[test]
    fn accepts_extension_origin() {
        let o = Origin::parse("chrome-extension://abcdefghijklmnop/").unwrap();
        assert_eq!(o.as_str(), "chrome-extension://abcdefghijklmnop");
    }

    #[test]
    fn rejects_paths_and_garbage() {
        for raw in [
            "null",
            "",
            "https://",
            "https://a.example/path",
            "https://a.example?x=1",
            "a.example",
            "https://user@a.example",
            "ht tp://a.example",
        ] {
            assert!(Origin::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    proptest::proptest! {
        #[test]
        fn parse_is_idempotent(
            scheme in "[a-zA-Z][a-zA-Z0-9+.-]{0,10}",
            host in "[a-zA-Z0-9.-]{1,20}",
            port in proptest::option::of(1u16..),
            slash in proptest::bool::ANY,
        ) {
            let mut raw = format!("{scheme}://{host}");
            if let Some(port) = port {
                raw.push_str(&format!(":{port}"));
            }
            if slash {
                raw.push('/');
            }
            let once = Origin::parse(&raw).unwrap();
            let twice = Origin::parse(once.as_str()).unwrap();
            proptest::prop_assert_eq!(once, twice);
        }
    }

    #[test]
    fn origins_compare_after_normalization() {
        assert_eq!(
            Origin::parse("https://A.example").unwrap(),
            Origin::parse("https://a.example/").unwrap()
        );
    }
}
