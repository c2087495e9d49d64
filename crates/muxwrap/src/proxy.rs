//! # Network policy
//!
//! Decides per outbound request whether the configured proxy is used. The
//! bypass list follows `NO_PROXY` conventions:
//!
//! - `host` or `host:port` matches that host exactly (any port when none is
//!   given)
//! - `.example.com` matches `example.com` and every subdomain, on label
//!   boundaries only (`notexample.com` does not match)
//! - `*.example.com` is accepted as an alias of `.example.com`
//!
//! A lone `*` is rejected: it would silently disable the proxy for
//! everything.

use std::fmt;

use reqwest::Proxy;
use tracing::debug;
use url::Url;

use crate::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BypassPatternError {
    #[error("'*' is not supported as a bypass pattern")]
    MatchAll,

    #[error("unsupported wildcard in bypass pattern '{0}'")]
    Wildcard(String),

    #[error("invalid port in bypass pattern '{0}'")]
    InvalidPort(String),

    #[error("invalid host in bypass pattern '{0}'")]
    InvalidHost(String),
}

/// One entry of the bypass list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassPattern {
    /// Exact host, optionally pinned to a port.
    Exact { host: String, port: Option<u16> },
    /// Domain and all of its subdomains, optionally pinned to a port.
    Suffix { domain: String, port: Option<u16> },
}

impl BypassPattern {
    pub fn parse(pattern: &str) -> Result<Self, BypassPatternError> {
        let pattern = pattern.trim();
        if pattern == "*" {
            return Err(BypassPatternError::MatchAll);
        }

        let (suffix, rest) = if let Some(rest) = pattern.strip_prefix("*.") {
            (true, rest)
        } else if let Some(rest) = pattern.strip_prefix('.') {
            (true, rest)
        } else {
            (false, pattern)
        };

        if rest.contains('*') {
            return Err(BypassPatternError::Wildcard(pattern.to_string()));
        }

        let (host, port) = split_port(rest)
            .ok_or_else(|| BypassPatternError::InvalidPort(pattern.to_string()))?;

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let valid_host = !host.is_empty()
            && host.split('.').all(|label| {
                !label.is_empty()
                    && label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            });
        if !valid_host {
            return Err(BypassPatternError::InvalidHost(pattern.to_string()));
        }

        Ok(if suffix {
            Self::Suffix { domain: host, port }
        } else {
            Self::Exact { host, port }
        })
    }

    pub fn matches(&self, host: &str, port: Option<u16>) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let port_ok = |wanted: &Option<u16>| wanted.is_none() || *wanted == port;

        match self {
            Self::Exact {
                host: expected,
                port: wanted,
            } => *expected == host && port_ok(wanted),
            Self::Suffix {
                domain,
                port: wanted,
            } => {
                let on_boundary = host == *domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.'));
                on_boundary && port_ok(wanted)
            }
        }
    }
}

/// Split `host[:port]`. Returns `None` when a port is present but invalid.
fn split_port(value: &str) -> Option<(&str, Option<u16>)> {
    match value.rsplit_once(':') {
        Some((host, port)) => port.parse::<u16>().ok().map(|port| (host, Some(port))),
        None => Some((value, None)),
    }
}

impl fmt::Display for BypassPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prefix, host, port) = match self {
            Self::Exact { host, port } => ("", host, port),
            Self::Suffix { domain, port } => (".", domain, port),
        };
        match port {
            Some(port) => write!(f, "{prefix}{host}:{port}"),
            None => write!(f, "{prefix}{host}"),
        }
    }
}

/// Which kind of outbound request is being routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    MainStream,
    Redirect,
    KeyDatabase,
}

/// Network path for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Proxy(Url),
}

/// Proxy URL plus bypass list. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyPolicy {
    proxy: Option<Url>,
    bypass: Vec<BypassPattern>,
}

impl ProxyPolicy {
    pub fn direct() -> Self {
        Self::default()
    }

    /// Build a policy from the proxy URL and a comma-separated bypass list.
    ///
    /// Invalid bypass entries are dropped and returned alongside the policy;
    /// the remaining entries still apply. A bypass list without a proxy, or
    /// an unparsable proxy URL, is a configuration error.
    pub fn load(
        proxy: Option<&str>,
        bypass: Option<&str>,
    ) -> Result<(Self, Vec<BypassPatternError>), ConfigurationError> {
        let proxy = proxy.map(str::trim).filter(|p| !p.is_empty());
        let bypass = bypass.map(str::trim).filter(|b| !b.is_empty());

        let proxy = match proxy {
            Some(raw) => {
                let url = Url::parse(raw)
                    .map_err(|e| ConfigurationError::Proxy(format!("'{raw}': {e}")))?;
                if url.host_str().is_none() {
                    return Err(ConfigurationError::Proxy(format!("'{raw}' has no host")));
                }
                Some(url)
            }
            None if bypass.is_some() => {
                return Err(ConfigurationError::Conflict(
                    "a proxy bypass list requires a proxy".to_string(),
                ));
            }
            None => None,
        };

        let mut patterns = Vec::new();
        let mut rejected = Vec::new();
        for entry in bypass.unwrap_or_default().split(',').map(str::trim) {
            if entry.is_empty() {
                continue;
            }
            match BypassPattern::parse(entry) {
                Ok(pattern) => patterns.push(pattern),
                Err(e) => rejected.push(e),
            }
        }

        Ok((
            Self {
                proxy,
                bypass: patterns,
            },
            rejected,
        ))
    }

    pub fn proxy(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    pub fn bypass(&self) -> &[BypassPattern] {
        &self.bypass
    }

    pub fn is_bypassed(&self, host: &str, port: Option<u16>) -> bool {
        self.bypass.iter().any(|p| p.matches(host, port))
    }

    /// Whether the proxy applies to `host[:port]`.
    pub fn use_proxy(&self, host: &str, port: Option<u16>) -> bool {
        self.proxy.is_some() && !self.is_bypassed(host, port)
    }

    /// Route a request. Key database fetches never use the proxy.
    pub fn route(&self, kind: RequestKind, target: &Url) -> Route {
        let Some(proxy) = &self.proxy else {
            return Route::Direct;
        };
        if kind == RequestKind::KeyDatabase {
            return Route::Direct;
        }

        let host = target.host_str().unwrap_or_default();
        let route = if self.is_bypassed(host, target.port_or_known_default()) {
            Route::Direct
        } else {
            Route::Proxy(proxy.clone())
        };
        debug!(?kind, host, ?route, "Resolved network route");
        route
    }

    /// Bypass list rendered in `NO_PROXY` form, for tools that read it.
    pub fn no_proxy_env(&self) -> Option<String> {
        if self.bypass.is_empty() {
            return None;
        }
        Some(
            self.bypass
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        )
    }
}

/// Build a reqwest proxy that routes every scheme through `url`.
pub fn build_proxy(url: &Url) -> Result<Proxy, String> {
    Proxy::all(url.as_str()).map_err(|e| format!("Invalid proxy URL: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(bypass: &str) -> ProxyPolicy {
        let (policy, rejected) = ProxyPolicy::load(Some("http://proxy:8080"), Some(bypass)).unwrap();
        assert!(rejected.is_empty(), "{rejected:?}");
        policy
    }

    #[test]
    fn test_suffix_on_label_boundary() {
        let pattern = BypassPattern::parse(".example.com").unwrap();
        assert!(pattern.matches("foo.example.com", Some(443)));
        assert!(pattern.matches("a.b.example.com", None));
        assert!(pattern.matches("example.com", Some(80)));
        assert!(pattern.matches("EXAMPLE.com.", Some(80)));
        assert!(!pattern.matches("notexample.com", Some(80)));
        assert!(!pattern.matches("example.com.evil", Some(80)));
    }

    #[test]
    fn test_exact_host_port() {
        let pattern = BypassPattern::parse("192.168.0.44:90").unwrap();
        assert!(pattern.matches("192.168.0.44", Some(90)));
        assert!(!pattern.matches("192.168.0.44", Some(80)));
        assert!(!pattern.matches("192.168.0.4", Some(90)));
        assert!(!pattern.matches("192.168.0.440", Some(90)));

        let any_port = BypassPattern::parse("media.local").unwrap();
        assert!(any_port.matches("media.local", Some(8080)));
        assert!(!any_port.matches("cdn.media.local", Some(8080)));
    }

    #[test]
    fn test_star_rejected() {
        assert_eq!(BypassPattern::parse("*"), Err(BypassPatternError::MatchAll));
        assert!(matches!(
            BypassPattern::parse("foo*.com"),
            Err(BypassPatternError::Wildcard(_))
        ));
        assert_eq!(
            BypassPattern::parse("*.example.com").unwrap(),
            BypassPattern::parse(".example.com").unwrap()
        );
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(
            BypassPattern::parse("host:99999"),
            Err(BypassPatternError::InvalidPort(_))
        ));
        assert!(matches!(
            BypassPattern::parse("bad..host"),
            Err(BypassPatternError::InvalidHost(_))
        ));
        assert!(matches!(
            BypassPattern::parse("."),
            Err(BypassPatternError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_bad_pattern_does_not_poison_others() {
        let (policy, rejected) =
            ProxyPolicy::load(Some("http://proxy:8080"), Some("*, .example.com ,bad host")).unwrap();
        assert_eq!(rejected.len(), 2);
        assert_eq!(policy.bypass().len(), 1);
        assert!(!policy.use_proxy("cdn.example.com", Some(443)));
        assert!(policy.use_proxy("other.net", Some(443)));
    }

    #[test]
    fn test_routes() {
        let policy = policy(".example.com,192.168.0.44:90");
        let proxied = Url::parse("https://cdn.other.net/live.m3u8").unwrap();
        let bypassed = Url::parse("https://cdn.example.com/live.m3u8").unwrap();
        let lan = Url::parse("http://192.168.0.44:90/stream").unwrap();

        assert!(matches!(
            policy.route(RequestKind::MainStream, &proxied),
            Route::Proxy(_)
        ));
        assert_eq!(policy.route(RequestKind::Redirect, &bypassed), Route::Direct);
        assert_eq!(policy.route(RequestKind::MainStream, &lan), Route::Direct);
        assert_eq!(
            policy.route(RequestKind::KeyDatabase, &proxied),
            Route::Direct
        );
    }

    #[test]
    fn test_default_port_is_considered() {
        let policy = policy("example.com:443");
        let https = Url::parse("https://example.com/a.m3u8").unwrap();
        let http = Url::parse("http://example.com/a.m3u8").unwrap();
        assert_eq!(policy.route(RequestKind::MainStream, &https), Route::Direct);
        assert!(matches!(
            policy.route(RequestKind::MainStream, &http),
            Route::Proxy(_)
        ));
    }

    #[test]
    fn test_no_proxy_configured() {
        let (policy, _) = ProxyPolicy::load(None, None).unwrap();
        assert!(!policy.use_proxy("anything", None));
        assert_eq!(policy.no_proxy_env(), None);

        assert!(matches!(
            ProxyPolicy::load(None, Some(".example.com")),
            Err(ConfigurationError::Conflict(_))
        ));
        assert!(matches!(
            ProxyPolicy::load(Some("not a url"), None),
            Err(ConfigurationError::Proxy(_))
        ));
    }

    #[test]
    fn test_no_proxy_env() {
        let policy = policy("*.example.com, 192.168.0.44:90 ,Media.Local");
        assert_eq!(
            policy.no_proxy_env().as_deref(),
            Some(".example.com,192.168.0.44:90,media.local")
        );
    }
}
