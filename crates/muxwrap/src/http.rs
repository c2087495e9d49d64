//! HTTP clients used for probing streams and fetching the key database.
//!
//! Redirects are never followed by reqwest itself: [`RoutedClient`] follows
//! them by hand so every hop is routed through [`ProxyPolicy`] on its own
//! host.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use rustls::{ClientConfig, crypto::aws_lc_rs};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::debug;
use url::Url;

use crate::proxy::{ProxyPolicy, RequestKind, Route, build_proxy};

pub const DEFAULT_USER_AGENT: &str = concat!("muxwrap/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirect hops followed for a single request.
pub const MAX_REDIRECTS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },

    #[error("too many redirects starting at {0}")]
    TooManyRedirects(String),

    #[error("redirect from {0} without a Location header")]
    MissingLocation(String),

    #[error("invalid redirect target '{target}': {reason}")]
    InvalidRedirect { target: String, reason: String },
}

/// Request settings shared by every client built from them.
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub user_agent: String,
    pub headers: HeaderMap,
    /// Overall request timeout. Zero disables it.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: HeaderMap::new(),
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl HttpOptions {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Add a header; invalid names or values are skipped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => debug!(header = name, "Skipping invalid HTTP header"),
        }
        self
    }
}

/// Create a reqwest client for one route. Redirects are disabled.
pub fn create_client(options: &HttpOptions, route: &Route) -> Result<Client, HttpError> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpError::Tls(e.to_string()))?
        .with_platform_verifier()
        .map_err(|e| HttpError::Tls(e.to_string()))?
        .with_no_client_auth();

    let mut builder = Client::builder()
        .user_agent(&options.user_agent)
        .default_headers(options.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(reqwest::redirect::Policy::none());

    if !options.timeout.is_zero() {
        builder = builder.timeout(options.timeout);
    }
    if !options.connect_timeout.is_zero() {
        builder = builder.connect_timeout(options.connect_timeout);
    }

    builder = match route {
        Route::Proxy(url) => builder.proxy(build_proxy(url).map_err(HttpError::Proxy)?),
        // Environment proxies must not leak into direct routes.
        Route::Direct => builder.no_proxy(),
    };

    builder.build().map_err(HttpError::from)
}

/// A pair of clients, direct and proxied, selected per hop by the policy.
#[derive(Debug, Clone)]
pub struct RoutedClient {
    policy: ProxyPolicy,
    direct: Client,
    proxied: Option<Client>,
}

impl RoutedClient {
    pub fn new(options: &HttpOptions, policy: ProxyPolicy) -> Result<Self, HttpError> {
        let direct = create_client(options, &Route::Direct)?;
        let proxied = match policy.proxy() {
            Some(url) => Some(create_client(options, &Route::Proxy(url.clone()))?),
            None => None,
        };
        Ok(Self {
            policy,
            direct,
            proxied,
        })
    }

    fn client_for(&self, kind: RequestKind, url: &Url) -> &Client {
        match (self.policy.route(kind, url), &self.proxied) {
            (Route::Proxy(_), Some(client)) => client,
            _ => &self.direct,
        }
    }

    /// GET the main stream `url`, following redirects with a fresh routing
    /// decision per hop. `range` adds a `Range: bytes=...` header to every hop.
    pub async fn get(&self, url: &Url, range: Option<&str>) -> Result<Response, HttpError> {
        self.fetch(RequestKind::MainStream, url, range).await
    }

    /// GET `url` as a request of `kind`. Hops after the first are routed as
    /// [`RequestKind::Redirect`], except for key database fetches, which stay
    /// direct all the way.
    pub async fn fetch(
        &self,
        kind: RequestKind,
        url: &Url,
        range: Option<&str>,
    ) -> Result<Response, HttpError> {
        let mut current = url.clone();
        let mut hop_kind = kind;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client_for(hop_kind, &current).get(current.clone());
            if let Some(range) = range {
                request = request.header(RANGE, format!("bytes={range}"));
            }
            let response = request.send().await?;

            if !response.status().is_redirection() {
                if !response.status().is_success() {
                    return Err(HttpError::Status {
                        url: current.to_string(),
                        status: response.status(),
                    });
                }
                return Ok(response);
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| HttpError::MissingLocation(current.to_string()))?;
            let next = current
                .join(location)
                .map_err(|e| HttpError::InvalidRedirect {
                    target: location.to_string(),
                    reason: e.to_string(),
                })?;
            debug!(from = %current, to = %next, "Following redirect");
            current = next;
            if kind != RequestKind::KeyDatabase {
                hop_kind = RequestKind::Redirect;
            }
        }

        Err(HttpError::TooManyRedirects(url.to_string()))
    }
}

/// Read at most `limit` bytes of a response body.
pub async fn read_limited(mut response: Response, limit: usize) -> Result<Vec<u8>, HttpError> {
    let mut body = Vec::new();
    while body.len() < limit {
        let Some(chunk) = response.chunk().await? else {
            break;
        };
        let take = chunk.len().min(limit - body.len());
        body.extend_from_slice(&chunk[..take]);
    }
    Ok(body)
}

/// A tiny HTTP/1.1 responder on a local port for exercising real requests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Debug, Clone)]
    pub(crate) enum Reply {
        Ok {
            content_type: &'static str,
            body: String,
        },
        Redirect(String),
    }

    impl Reply {
        pub(crate) fn ok(content_type: &'static str, body: impl Into<String>) -> Self {
            Self::Ok {
                content_type,
                body: body.into(),
            }
        }

        pub(crate) fn redirect(location: impl Into<String>) -> Self {
            Self::Redirect(location.into())
        }
    }

    pub(crate) struct TestServer {
        pub addr: SocketAddr,
        targets: Arc<Mutex<Vec<String>>>,
    }

    impl TestServer {
        /// Serve `routes`, keyed by request target (`/path` for origin-form
        /// requests, the full URL for proxied ones). `*` matches anything.
        pub(crate) async fn start(routes: Vec<(&str, Reply)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let routes: Arc<HashMap<String, Reply>> = Arc::new(
                routes
                    .into_iter()
                    .map(|(target, reply)| (target.to_string(), reply))
                    .collect(),
            );
            let targets = Arc::new(Mutex::new(Vec::new()));

            let seen = targets.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = routes.clone();
                    let seen = seen.clone();
                    tokio::spawn(async move {
                        let _ = answer(stream, &routes, &seen).await;
                    });
                }
            });

            Self { addr, targets }
        }

        pub(crate) fn url(&self, path: &str) -> url::Url {
            url::Url::parse(&format!("http://{}{path}", self.addr)).unwrap()
        }

        /// Request targets received so far, in arrival order.
        pub(crate) fn targets(&self) -> Vec<String> {
            self.targets.lock().unwrap().clone()
        }
    }

    async fn answer(
        mut stream: TcpStream,
        routes: &HashMap<String, Reply>,
        seen: &Mutex<Vec<String>>,
    ) -> std::io::Result<()> {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            head.extend_from_slice(&buf[..n]);
        }

        let head = String::from_utf8_lossy(&head);
        let target = head
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or_default()
            .to_string();
        seen.lock().unwrap().push(target.clone());

        let response = match routes.get(&target).or_else(|| routes.get("*")) {
            Some(Reply::Ok { content_type, body }) => format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            ),
            Some(Reply::Redirect(location)) => format!(
                "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            ),
            None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_string(),
        };
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Reply, TestServer};
    use super::*;

    #[test]
    fn test_options_headers() {
        let options = HttpOptions::default()
            .with_user_agent("VLC/3.0")
            .with_header("Referer", "https://example.com/")
            .with_header("bad header", "x");
        assert_eq!(options.user_agent, "VLC/3.0");
        assert_eq!(options.headers.len(), 1);
        assert_eq!(options.headers["referer"], "https://example.com/");
    }

    #[test]
    fn test_clients_build_for_both_routes() {
        let options = HttpOptions::default();
        assert!(create_client(&options, &Route::Direct).is_ok());

        let (policy, _) = ProxyPolicy::load(Some("http://127.0.0.1:3128"), None).unwrap();
        let routed = RoutedClient::new(&options, policy).unwrap();
        assert!(routed.proxied.is_some());
    }

    #[tokio::test]
    async fn test_redirect_hop_routed_by_its_own_host() {
        let origin = TestServer::start(vec![("/final", Reply::ok("text/plain", "direct"))]).await;
        // Stands in for the proxy: answers the absolute-form request for the
        // proxied host with a redirect to the bypassed origin.
        let proxy = TestServer::start(vec![(
            "http://stream.test/start",
            Reply::redirect(origin.url("/final").to_string()),
        )])
        .await;

        let proxy_url = format!("http://{}", proxy.addr);
        let (policy, rejected) = ProxyPolicy::load(Some(proxy_url.as_str()), Some("127.0.0.1")).unwrap();
        assert!(rejected.is_empty());
        let client = RoutedClient::new(&HttpOptions::default(), policy).unwrap();

        let start = Url::parse("http://stream.test/start").unwrap();
        let response = client.get(&start, None).await.unwrap();
        assert_eq!(response.text().await.unwrap(), "direct");

        assert_eq!(proxy.targets(), ["http://stream.test/start"]);
        assert_eq!(origin.targets(), ["/final"]);
    }

    #[tokio::test]
    async fn test_redirect_loop_is_bounded() {
        let server = TestServer::start(vec![("*", Reply::redirect("/again"))]).await;
        let client = RoutedClient::new(&HttpOptions::default(), ProxyPolicy::direct()).unwrap();

        let result = client.get(&server.url("/start"), None).await;
        assert!(matches!(result, Err(HttpError::TooManyRedirects(_))));
        assert_eq!(server.targets().len(), MAX_REDIRECTS + 1);
    }

    #[tokio::test]
    async fn test_key_database_hops_stay_direct() {
        let server = TestServer::start(vec![
            ("/old", Reply::redirect("/new")),
            ("/new", Reply::ok("application/json", "{}")),
        ])
        .await;
        // Unreachable proxy: any proxied hop would fail.
        let (policy, _) = ProxyPolicy::load(Some("http://127.0.0.1:9"), None).unwrap();
        let client = RoutedClient::new(&HttpOptions::default(), policy).unwrap();

        let response = client
            .fetch(RequestKind::KeyDatabase, &server.url("/old"), None)
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "{}");
        assert_eq!(server.targets(), ["/old", "/new"]);
    }
}
