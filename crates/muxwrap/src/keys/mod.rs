//! # Decryption key resolution
//!
//! Keys come either from the `clearkey` directive or from a key database
//! (JSON object of URL pattern to key string). A directive key always wins;
//! otherwise the first database entry whose pattern matches the clean URL is
//! used. No match means the stream is treated as unencrypted.
//!
//! Key strings are comma-separated lists of `KEY` or `KID:KEY` entries. They
//! are split and forwarded as-is; validating key material is left to the mux
//! stage.

mod database;
mod pattern;

pub use database::{DatabaseLocation, KeyDatabase, KeyDatabaseError, KeyEntry};
pub use pattern::UrlPattern;

use std::fmt;

use tracing::debug;

/// One decryption key, optionally bound to a key ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub kid: Option<String>,
    pub key: String,
}

impl KeyPair {
    /// Parse a single `KEY` or `KID:KEY` entry. Returns `None` for blank input.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }
        match entry.split_once(':') {
            Some((kid, key)) if !kid.trim().is_empty() => Some(Self {
                kid: Some(kid.trim().to_string()),
                key: key.trim().to_string(),
            }),
            Some((_, key)) => Some(Self {
                kid: None,
                key: key.trim().to_string(),
            }),
            None => Some(Self {
                kid: None,
                key: entry.to_string(),
            }),
        }
    }
}

impl fmt::Display for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kid {
            Some(kid) => write!(f, "{kid}:{}", self.key),
            None => f.write_str(&self.key),
        }
    }
}

/// Split a comma-delimited key list.
pub fn parse_key_list(value: &str) -> Vec<KeyPair> {
    value.split(',').filter_map(KeyPair::parse).collect()
}

/// Where a resolved key set came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Directive,
    Database { pattern: String },
}

/// Non-empty set of keys that all apply to the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    keys: Vec<KeyPair>,
    source: KeySource,
}

impl KeySet {
    pub fn new(keys: Vec<KeyPair>, source: KeySource) -> Option<Self> {
        if keys.is_empty() {
            None
        } else {
            Some(Self { keys, source })
        }
    }

    pub fn keys(&self) -> &[KeyPair] {
        &self.keys
    }

    pub fn source(&self) -> &KeySource {
        &self.source
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Resolve the key set for `clean_url`.
pub fn resolve(
    clean_url: &str,
    directive_key: Option<&str>,
    database: &KeyDatabase,
) -> Option<KeySet> {
    if let Some(set) = directive_key
        .and_then(|value| KeySet::new(parse_key_list(value), KeySource::Directive))
    {
        debug!(count = set.len(), "Using decryption key(s) from directive");
        return Some(set);
    }

    let entry = database.first_match(clean_url)?;
    debug!(pattern = %entry.pattern, "Key database entry matched");
    KeySet::new(
        entry.keys.clone(),
        KeySource::Database {
            pattern: entry.pattern.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> KeyDatabase {
        KeyDatabase::from_json(
            r#"{
                "https://a.b/*/c/*.mpd": "00112233445566778899aabbccddeeff",
                "https://a.b/*": "kid1:ffeeddccbbaa99887766554433221100,kid2:0f0e0d0c0b0a09080706050403020100"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_key_list() {
        let keys = parse_key_list(" abc , kid:def,,:ghi ");
        assert_eq!(
            keys,
            vec![
                KeyPair {
                    kid: None,
                    key: "abc".into()
                },
                KeyPair {
                    kid: Some("kid".into()),
                    key: "def".into()
                },
                KeyPair {
                    kid: None,
                    key: "ghi".into()
                },
            ]
        );
        assert!(parse_key_list(" , ").is_empty());
    }

    #[test]
    fn test_database_match() {
        let db = database();
        let set = resolve("https://a.b/x/c/y.mpd", None, &db).unwrap();
        assert_eq!(set.keys()[0].key, "00112233445566778899aabbccddeeff");
        assert_eq!(
            set.source(),
            &KeySource::Database {
                pattern: "https://a.b/*/c/*.mpd".into()
            }
        );
    }

    #[test]
    fn test_first_match_wins() {
        // Both patterns match; document order decides.
        let db = database();
        let set = resolve("https://a.b/1/c/2.mpd", None, &db).unwrap();
        assert_eq!(set.len(), 1);

        let set = resolve("https://a.b/x/d/y.mpd", None, &db).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.keys()[1].kid.as_deref(), Some("kid2"));
    }

    #[test]
    fn test_no_match_is_none() {
        let db = KeyDatabase::from_json(r#"{"https://a.b/*/c/*.mpd": "abc"}"#).unwrap();
        assert!(resolve("https://a.b/x/d/y.mpd", None, &db).is_none());
        assert!(resolve("https://a.b/x/c/y.mpd", None, &KeyDatabase::empty()).is_none());
    }

    #[test]
    fn test_directive_overrides_database() {
        let db = database();
        let set = resolve("https://a.b/x/c/y.mpd", Some("5ce85f1aa5771900b952f0ba58857d7a"), &db)
            .unwrap();
        assert_eq!(set.source(), &KeySource::Directive);
        assert_eq!(set.keys()[0].key, "5ce85f1aa5771900b952f0ba58857d7a");
    }

    #[test]
    fn test_blank_directive_falls_back() {
        let db = database();
        let set = resolve("https://a.b/x/c/y.mpd", Some(" , "), &db).unwrap();
        assert!(matches!(set.source(), KeySource::Database { .. }));
    }
}
