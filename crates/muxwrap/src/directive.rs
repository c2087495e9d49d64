//! # Directive parsing
//!
//! Hosts pass per-channel options by appending them to the stream URL as a
//! trailing fragment, e.g.
//!
//! ```text
//! https://cdn.example/live/manifest.mpd#clearkey=5ce85f1aa5771900b952f0ba58857d7a&referer=https://site/
//! ```
//!
//! [`parse`] splits such a URL into the clean request URL and the directive
//! mapping. The clean URL is the only URL that is ever sent anywhere.
//!
//! A fragment only counts as a directive region when at least one of its
//! tokens names a recognised directive. Any other fragment is left untouched,
//! so parsing a clean URL again always yields an empty mapping.

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::percent_decode_str;
use url::Url;

/// Separator between the request URL and the directive region.
pub const REGION_DELIMITER: char = '#';
/// Separator between individual directives.
pub const JOIN_DELIMITER: char = '&';

/// The recognised directive keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DirectiveKey {
    ClearKey,
    Referer,
    Origin,
    Stream,
    NoVariantCheck,
    NoAudio,
    NoVideo,
}

impl DirectiveKey {
    pub const ALL: [DirectiveKey; 7] = [
        DirectiveKey::ClearKey,
        DirectiveKey::Referer,
        DirectiveKey::Origin,
        DirectiveKey::Stream,
        DirectiveKey::NoVariantCheck,
        DirectiveKey::NoAudio,
        DirectiveKey::NoVideo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DirectiveKey::ClearKey => "clearkey",
            DirectiveKey::Referer => "referer",
            DirectiveKey::Origin => "origin",
            DirectiveKey::Stream => "stream",
            DirectiveKey::NoVariantCheck => "novariantcheck",
            DirectiveKey::NoAudio => "noaudio",
            DirectiveKey::NoVideo => "novideo",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(name))
    }

    fn is_flag(&self) -> bool {
        matches!(
            self,
            DirectiveKey::NoVariantCheck | DirectiveKey::NoAudio | DirectiveKey::NoVideo
        )
    }

    fn is_url(&self) -> bool {
        matches!(self, DirectiveKey::Referer | DirectiveKey::Origin)
    }
}

impl fmt::Display for DirectiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DirectiveError {
    #[error("directive '{key}' contains malformed percent-encoding: '{value}'")]
    MalformedEncoding { key: String, value: String },

    #[error("directive '{key}' is not valid UTF-8 once decoded")]
    InvalidUtf8 { key: String },

    #[error("directive '{key}' must be an absolute URL, got '{value}'")]
    InvalidUrl { key: String, value: String },

    #[error("directive '{key}' expects a boolean, got '{value}'")]
    InvalidFlag { key: String, value: String },
}

/// Directive mapping extracted from a URL.
///
/// Every token of the region is kept in `raw` (last one wins on duplicate
/// keys), including keys this version does not understand. The typed
/// accessors only expose the recognised ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    raw: BTreeMap<String, String>,
    flags: BTreeMap<DirectiveKey, bool>,
}

impl Directives {
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Value of a recognised directive. Empty values are treated as absent.
    pub fn get(&self, key: DirectiveKey) -> Option<&str> {
        self.raw
            .get(key.as_str())
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Raw value for any key, recognised or not.
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }

    /// Boolean directive value, already validated at parse time.
    pub fn flag(&self, key: DirectiveKey) -> Option<bool> {
        self.flags.get(&key).copied()
    }

    pub fn clearkey(&self) -> Option<&str> {
        self.get(DirectiveKey::ClearKey)
    }

    pub fn referer(&self) -> Option<&str> {
        self.get(DirectiveKey::Referer)
    }

    pub fn origin(&self) -> Option<&str> {
        self.get(DirectiveKey::Origin)
    }

    pub fn stream(&self) -> Option<&str> {
        self.get(DirectiveKey::Stream)
    }

    /// Keys present in the region that are not recognised.
    pub fn unknown_keys(&self) -> impl Iterator<Item = &str> {
        self.raw
            .keys()
            .map(String::as_str)
            .filter(|key| DirectiveKey::from_name(key).is_none())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.raw.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Result of [`parse`]: the clean URL and the directives removed from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    pub clean_url: String,
    pub directives: Directives,
}

impl ParsedUrl {
    fn plain(url: &str) -> Self {
        Self {
            clean_url: url.to_string(),
            directives: Directives::default(),
        }
    }
}

fn tokenize(region: &str) -> Vec<(String, &str)> {
    region
        .split(JOIN_DELIMITER)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            let (key, value) = token.split_once('=').unwrap_or((token, ""));
            (key.trim().to_ascii_lowercase(), value.trim())
        })
        .collect()
}

/// Split `raw_url` into the clean URL and its directive mapping.
///
/// The directive region starts at the first `#` whose tokens name a
/// recognised directive, so directive values may themselves contain `#`.
pub fn parse(raw_url: &str) -> Result<ParsedUrl, DirectiveError> {
    let found = raw_url
        .match_indices(REGION_DELIMITER)
        .map(|(index, _)| (index, tokenize(&raw_url[index + REGION_DELIMITER.len_utf8()..])))
        .find(|(_, tokens)| {
            tokens
                .iter()
                .any(|(key, _)| DirectiveKey::from_name(key).is_some())
        });
    let Some((index, tokens)) = found else {
        return Ok(ParsedUrl::plain(raw_url));
    };

    let mut directives = Directives::default();
    for (key, value) in tokens {
        check_percent_encoding(&key, value)?;

        let value = match DirectiveKey::from_name(&key) {
            Some(known) if known.is_url() && !value.is_empty() => normalize_url_value(&key, value)?,
            Some(known) if known.is_flag() => {
                directives.flags.insert(known, parse_flag(&key, value)?);
                value.to_string()
            }
            _ => value.to_string(),
        };

        directives.raw.insert(key, value);
    }

    Ok(ParsedUrl {
        clean_url: raw_url[..index].to_string(),
        directives,
    })
}

/// Reject `%` sequences that are not followed by two hex digits.
fn check_percent_encoding(key: &str, value: &str) -> Result<(), DirectiveError> {
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes
                .get(i + 1..i + 3)
                .is_some_and(|pair| pair.iter().all(u8::is_ascii_hexdigit));
            if !valid {
                return Err(DirectiveError::MalformedEncoding {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// URL-valued directives are kept verbatim when they already parse, and
/// percent-decoded otherwise (hosts often escape them to survive the `&`
/// split).
fn normalize_url_value(key: &str, value: &str) -> Result<String, DirectiveError> {
    if Url::parse(value).is_ok() {
        return Ok(value.to_string());
    }

    let decoded = percent_decode_str(value)
        .decode_utf8()
        .map_err(|_| DirectiveError::InvalidUtf8 {
            key: key.to_string(),
        })?;

    match Url::parse(&decoded) {
        Ok(_) => Ok(decoded.into_owned()),
        Err(_) => Err(DirectiveError::InvalidUrl {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

pub(crate) fn parse_flag(key: &str, value: &str) -> Result<bool, DirectiveError> {
    match value.to_ascii_lowercase().as_str() {
        "" | "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(DirectiveError::InvalidFlag {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
