//! URL parsing utilities
//!
//! These functions avoid allocations and work directly on string slices.
//! `Origin` is the owned, normalized unit of site scoping.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::config::LOOP_MARKER;

// =============================================================================
// Scheme Extraction
// =============================================================================

/// URL schemes the rule system cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    fn default_port(self) -> &'static str {
        match self {
            Scheme::Http => "80",
            Scheme::Https => "443",
        }
    }
}

/// Fast scheme extraction without URL parsing.
/// Returns None for anything other than http(s).
#[inline]
pub fn extract_scheme(url: &str) -> Option<Scheme> {
    let bytes = url.as_bytes();
    if bytes.len() >= 8 && bytes[..8].eq_ignore_ascii_case(b"https://") {
        Some(Scheme::Https)
    } else if bytes.len() >= 7 && bytes[..7].eq_ignore_ascii_case(b"http://") {
        Some(Scheme::Http)
    } else {
        None
    }
}

/// Get the position after "://".
#[inline]
pub fn get_scheme_end(url: &str) -> Option<usize> {
    let colon_pos = url.find(':')?;
    if url[colon_pos..].starts_with("://") {
        Some(colon_pos + 3)
    } else {
        None
    }
}

// =============================================================================
// Host Extraction
// =============================================================================

/// Get the start and end positions of the authority (host with port) in a
/// URL, skipping any userinfo.
#[inline]
pub fn get_authority_position(url: &str) -> Option<(usize, usize)> {
    let scheme_end = get_scheme_end(url)?;
    let bytes = url.as_bytes();

    let mut end = bytes.len();
    for (i, &b) in bytes[scheme_end..].iter().enumerate() {
        if b == b'/' || b == b'?' || b == b'#' {
            end = scheme_end + i;
            break;
        }
    }

    let start = match url[scheme_end..end].rfind('@') {
        Some(at) => scheme_end + at + 1,
        None => scheme_end,
    };

    Some((start, end))
}

/// Extract host with port if present.
#[inline]
pub fn extract_host_with_port(url: &str) -> Option<&str> {
    let (start, end) = get_authority_position(url)?;
    Some(&url[start..end])
}

/// Fast host extraction without allocations.
/// Returns a slice into the original URL.
#[inline]
pub fn extract_host(url: &str) -> Option<&str> {
    let authority = extract_host_with_port(url)?;
    Some(split_port(authority).0)
}

fn split_port(authority: &str) -> (&str, Option<&str>) {
    match authority.rfind(':') {
        Some(pos) if authority[pos + 1..].bytes().all(|b| b.is_ascii_digit()) => {
            (&authority[..pos], Some(&authority[pos + 1..]))
        }
        _ => (authority, None),
    }
}

// =============================================================================
// Structured URL
// =============================================================================

/// A borrowed view of an http(s) URL split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlParts<'a> {
    pub scheme: Scheme,
    /// Host with port, without userinfo.
    pub authority: &'a str,
    /// Path including the leading '/', or empty.
    pub path: &'a str,
    /// Query without the leading '?'.
    pub query: Option<&'a str>,
    /// Fragment without the leading '#'.
    pub fragment: Option<&'a str>,
}

impl<'a> UrlParts<'a> {
    /// Split an http(s) URL. Returns None for other schemes or an empty host.
    pub fn parse(url: &'a str) -> Option<Self> {
        let scheme = extract_scheme(url)?;
        let (auth_start, auth_end) = get_authority_position(url)?;
        let authority = &url[auth_start..auth_end];
        if authority.is_empty() {
            return None;
        }

        let rest = &url[auth_end..];
        let (rest, fragment) = match rest.find('#') {
            Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
            None => (rest, None),
        };
        let (path, query) = match rest.find('?') {
            Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
            None => (rest, None),
        };

        Some(Self {
            scheme,
            authority,
            path,
            query,
            fragment,
        })
    }

    /// Host with port followed by path, the part a resizing endpoint takes.
    pub fn host_and_path(&self) -> String {
        format!("{}{}", self.authority, self.path)
    }

    /// Serialize without the fragment.
    pub fn without_fragment(&self) -> String {
        let mut out = format!("{}://{}{}", self.scheme.as_str(), self.authority, self.path);
        if let Some(query) = self.query {
            out.push('?');
            out.push_str(query);
        }
        out
    }
}

/// Remove the redirect-loop marker fragment, if present.
pub fn strip_loop_marker(url: &str) -> &str {
    let marker_len = LOOP_MARKER.len() + 1;
    if url.len() >= marker_len
        && url.ends_with(LOOP_MARKER)
        && url.as_bytes()[url.len() - marker_len] == b'#'
    {
        &url[..url.len() - marker_len]
    } else {
        url
    }
}

// =============================================================================
// Origin
// =============================================================================

/// Normalized scheme + host (+ non-default port), no path or query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Origin(String);

impl Origin {
    /// Parse the origin of an http(s) URL, or of a bare origin string.
    pub fn parse(url: &str) -> Option<Self> {
        let scheme = extract_scheme(url)?;
        let authority = extract_host_with_port(url)?;
        let (host, port) = split_port(authority);
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }
        let valid = host
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'[' | b']' | b':'));
        if !valid {
            return None;
        }

        let mut origin = format!("{}://{}", scheme.as_str(), host);
        if let Some(port) = port.filter(|p| !p.is_empty() && *p != scheme.default_port()) {
            origin.push(':');
            origin.push_str(port);
        }
        Some(Self(origin))
    }

    /// Wrap a string already in normalized origin form.
    pub(crate) fn from_normalized(origin: String) -> Self {
        Self(origin)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hostname without scheme or port.
    pub fn host(&self) -> &str {
        extract_host(&self.0).unwrap_or_default()
    }

    pub fn scheme(&self) -> Scheme {
        extract_scheme(&self.0).unwrap_or(Scheme::Https)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Origin {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Origin {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Origin::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid origin: {raw}")))
    }
}
