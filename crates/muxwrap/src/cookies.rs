//! Netscape cookie jar support.
//!
//! Each non-comment line holds seven tab-separated fields:
//! `domain  include_subdomains  path  secure  expires  name  value`.
//! Lines prefixed with `#HttpOnly_` are cookies, not comments.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use url::Url;

use crate::config::resolve_install_path;
use crate::error::ConfigurationError;

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    /// Unix timestamp; `0` marks a session cookie.
    pub expires: u64,
    pub name: String,
    pub value: String,
}

impl Cookie {
    fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let line = match line.strip_prefix(HTTP_ONLY_PREFIX) {
            Some(rest) => rest,
            None if line.starts_with('#') || line.trim().is_empty() => return None,
            None => line,
        };

        let fields: Vec<&str> = line.split('\t').collect();
        let [domain, subdomains, path, secure, expires, name, value] = fields[..] else {
            return None;
        };

        Some(Self {
            domain: domain.trim_start_matches('.').to_ascii_lowercase(),
            include_subdomains: subdomains.eq_ignore_ascii_case("TRUE")
                || domain.starts_with('.'),
            path: path.to_string(),
            secure: secure.eq_ignore_ascii_case("TRUE"),
            expires: expires.parse().ok()?,
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    fn domain_matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        host == self.domain
            || (self.include_subdomains
                && host
                    .strip_suffix(self.domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.')))
    }

    fn path_matches(&self, path: &str) -> bool {
        path == self.path
            || (path.starts_with(self.path.as_str())
                && (self.path.ends_with('/') || path[self.path.len()..].starts_with('/')))
    }

    /// Whether this cookie would be sent with a request to `url` at `now`.
    pub fn applies_to(&self, url: &Url, now: u64) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        (self.expires == 0 || self.expires > now)
            && (!self.secure || url.scheme() == "https")
            && self.domain_matches(host)
            && self.path_matches(url.path())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    path: Option<PathBuf>,
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn parse(content: &str) -> Self {
        let mut cookies = Vec::new();
        for (number, line) in content.lines().enumerate() {
            let commented = line.starts_with('#') && !line.starts_with(HTTP_ONLY_PREFIX);
            if commented || line.trim().is_empty() {
                continue;
            }
            match Cookie::parse_line(line) {
                Some(cookie) => cookies.push(cookie),
                None => warn!(line = number + 1, "Skipping malformed cookie jar line"),
            }
        }
        Self {
            path: None,
            cookies,
        }
    }

    /// Load a jar; relative paths are resolved against `install_dir`.
    pub fn load(path: &Path, install_dir: &Path) -> Result<Self, ConfigurationError> {
        let path = resolve_install_path(install_dir, path);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ConfigurationError::invalid_option("cookies", format!("{}: {e}", path.display()))
        })?;

        let mut jar = Self::parse(&content);
        debug!(path = %path.display(), cookies = jar.cookies.len(), "Loaded cookie jar");
        jar.path = Some(path);
        Ok(jar)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Cookies that apply to `url`, in jar order.
    pub fn matching<'a>(&'a self, url: &'a Url, now: u64) -> impl Iterator<Item = &'a Cookie> {
        self.cookies.iter().filter(move |c| c.applies_to(url, now))
    }
}
