//! Storage key construction and canonicalization.
//!
//! Keys are `/`-joined segments where each segment is percent-encoded so it
//! can never contain a separator. Writes always use the canonical
//! slash-joined form; older data written with comma-joined repository names
//! or a single `%2F`-encoded segment stays readable through
//! [`try_normalize_repo_names`].

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Everything outside RFC 3986 unreserved characters is encoded, `%` included.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Separator between key segments.
pub const KEY_SEPARATOR: char = '/';

/// Legacy separator some writers used between repository name parts.
pub const LEGACY_SEPARATOR: char = ',';

fn is_separator(c: char) -> bool {
    c == KEY_SEPARATOR || c == LEGACY_SEPARATOR
}

/// Percent-encode a single key segment.
///
/// Empty input yields an empty string. The dot segments `.` and `..` are
/// encoded so a key can never address a parent directory.
pub fn sanitize_segment(segment: &str) -> String {
    match segment {
        "" => String::new(),
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        other => utf8_percent_encode(other, SEGMENT).to_string(),
    }
}

/// Build a canonical key from ordered segments.
///
/// Each segment is split on `/` and `,` first, so `["vendor/pkg"]` and
/// `["vendor", "pkg"]` build the same key. Empty parts are dropped.
pub fn build_key<S: AsRef<str>>(segments: &[S]) -> String {
    let parts: Vec<String> = segments
        .iter()
        .flat_map(|segment| segment.as_ref().split(is_separator))
        .filter(|part| !part.is_empty())
        .map(sanitize_segment)
        .collect();
    parts.join("/")
}

/// Canonicalize a key regardless of how it was previously encoded.
///
/// Percent-encoded separators are decoded and re-split. Applying this to an
/// already canonical key returns it unchanged.
pub fn normalize_storage_key(key: &str) -> String {
    let mut parts = Vec::new();
    for raw in key.split(is_separator).filter(|p| !p.is_empty()) {
        let decoded = percent_decode_str(raw).decode_utf8_lossy();
        parts.extend(
            decoded
                .split(is_separator)
                .filter(|p| !p.is_empty())
                .map(sanitize_segment),
        );
    }
    parts.join("/")
}

/// Alternate encodings a repository name may have been stored under.
///
/// The canonical slash-joined form comes first, followed by the comma-joined
/// and single-segment encodings. Duplicates are removed, so a flat name
/// yields exactly one entry.
pub fn try_normalize_repo_names(name: &str) -> Vec<String> {
    let canonical = normalize_storage_key(name);
    if canonical.is_empty() {
        return Vec::new();
    }
    let parts: Vec<&str> = canonical.split(KEY_SEPARATOR).collect();

    let mut names = vec![canonical.clone()];
    for candidate in [
        parts.join(","),
        sanitize_segment(&parts.join("/")),
    ] {
        if !names.contains(&candidate) {
            names.push(candidate);
        }
    }
    names
}

/// A canonical storage key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    /// Build a key from ordered segments (see [`build_key`]).
    pub fn from_segments<S: AsRef<str>>(segments: &[S]) -> crate::Result<Self> {
        let key = build_key(segments);
        if key.is_empty() {
            return Err(crate::Error::InvalidKey(
                "key has no non-empty segments".to_string(),
            ));
        }
        Ok(Self(key))
    }

    /// Canonicalize an existing key string (see [`normalize_storage_key`]).
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let key = normalize_storage_key(raw);
        if key.is_empty() {
            return Err(crate::Error::InvalidKey(format!("empty key: {raw:?}")));
        }
        Ok(Self(key))
    }

    /// Append segments to this key.
    pub fn join<S: AsRef<str>>(&self, segments: &[S]) -> Self {
        let tail = build_key(segments);
        if tail.is_empty() {
            return self.clone();
        }
        Self(format!("{}/{}", self.0, tail))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the encoded segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(KEY_SEPARATOR)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({})", self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StorageKey {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.0
    }
}
