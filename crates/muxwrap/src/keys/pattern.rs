//! Whole-string glob matching for key database patterns.
//!
//! `*` matches any run of characters, `/` included, so
//! `https://a.b/*/c/*.mpd` matches `https://a.b/x/y/c/z.mpd`. Matching is
//! case-sensitive and anchored at both ends. There is no other special
//! character.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    raw: String,
    // `raw` split on `*`; always at least one element
    segments: Vec<String>,
}

impl UrlPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let segments = raw.split('*').map(str::to_owned).collect();
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_literal(&self) -> bool {
        self.segments.len() == 1
    }

    pub fn matches(&self, text: &str) -> bool {
        let (first, rest) = match self.segments.split_first() {
            Some(parts) => parts,
            None => return text.is_empty(),
        };
        let Some((last, middle)) = rest.split_last() else {
            return text == first;
        };

        if text.len() < first.len() + last.len()
            || !text.starts_with(first.as_str())
            || !text.ends_with(last.as_str())
        {
            return false;
        }

        // Leftmost placement of each middle segment leaves the most room for
        // the ones after it.
        let mut remaining = &text[first.len()..text.len() - last.len()];
        for segment in middle.iter().filter(|s| !s.is_empty()) {
            match remaining.find(segment.as_str()) {
                Some(pos) => remaining = &remaining[pos + segment.len()..],
                None => return false,
            }
        }
        true
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
