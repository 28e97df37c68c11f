// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;

/// End-exclusive key interval `[begin, end)`.
///
/// Keys are opaque byte strings; the empty key is a valid `begin` and
/// `keyspace_end()` is the conventional upper bound of the user keyspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub begin: Bytes,
    pub end: Bytes,
}

impl KeyRange {
    pub fn new(begin: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    /// The whole user keyspace `["", \xff)`.
    pub fn all() -> Self {
        Self::new(Bytes::new(), keyspace_end())
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", printable(&self.begin), printable(&self.end))
    }
}

/// Upper bound of the user keyspace.
pub fn keyspace_end() -> Bytes {
    Bytes::from_static(b"\xff")
}

/// Render a key for logs and range identifiers.
///
/// Printable ASCII passes through; backslash and everything else becomes
/// `\xNN`. Keys are not assumed to be UTF-8.
pub fn printable(key: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(key.len());
    for &b in key {
        if (0x20..0x7f).contains(&b) && b != b'\\' {
            out.push(b as char);
        } else {
            let _ = write!(out, "\\x{b:02x}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_escapes_non_ascii() {
        assert_eq!(printable(b"abc"), "abc");
        assert_eq!(printable(b"a\x00b"), "a\\x00b");
        assert_eq!(printable(b"\xff"), "\\xff");
        assert_eq!(printable(b"a\\b"), "a\\x5cb");
        assert_eq!(printable(b""), "");
    }

    #[test]
    fn range_display_is_printable_pair() {
        let r = KeyRange::new(&b"a"[..], keyspace_end());
        assert_eq!(r.to_string(), "a-\\xff");
    }

    #[test]
    fn all_spans_keyspace() {
        let r = KeyRange::all();
        assert!(r.begin.is_empty());
        assert_eq!(&r.end[..], b"\xff");
        assert!(!r.is_empty());
    }
}
