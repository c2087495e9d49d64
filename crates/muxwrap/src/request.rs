//! Ties the resolvers together: raw input → prepared request → resolved
//! request → pipeline spec.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::cookies::CookieJar;
use crate::directive::{self, DirectiveKey};
use crate::error::ConfigurationError;
use crate::http::RoutedClient;
use crate::keys::{self, KeyDatabase, KeySet};
use crate::pipeline::{FetchCommand, MuxCommand, PipelineSpec};
use crate::proxy::{ProxyPolicy, RequestKind, Route};
use crate::variant::{ListingProbe, ManifestProbe, VariantEngine, VariantFlags, VariantOutcome};

/// What the host hands over for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub input_url: String,
    pub user_agent: String,
}

/// Command-line or config-file equivalents of the directives. A directive
/// in the URL always overrides the matching option here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticOptions {
    pub clearkey: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub stream: Option<String>,
    pub no_variant_check: bool,
    pub no_audio: bool,
    pub no_video: bool,
    pub subtitles: bool,
    /// Extra request headers, sent after the built-in ones.
    pub headers: Vec<(String, String)>,
}

/// Directives stripped and merged with static options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRequest {
    /// The input with its directive region removed, byte for byte. Key
    /// patterns and the fetch stage see exactly this string.
    pub clean_url: String,
    /// `clean_url` parsed, for routing, probing and cookie matching.
    pub target: Url,
    pub user_agent: String,
    pub clearkey: Option<String>,
    pub referer: Option<String>,
    pub origin: Option<String>,
    pub stream: Option<String>,
    pub flags: VariantFlags,
    pub subtitles: bool,
    pub extra_headers: Vec<(String, String)>,
}

impl PreparedRequest {
    pub fn prepare(raw: &RawRequest, options: &StaticOptions) -> Result<Self, ConfigurationError> {
        let input = raw.input_url.trim();
        if input.is_empty() {
            return Err(ConfigurationError::MissingInput("input URL"));
        }
        let user_agent = raw.user_agent.trim();
        if user_agent.is_empty() {
            return Err(ConfigurationError::MissingInput("user agent"));
        }

        let parsed = directive::parse(input)?;
        let directives = parsed.directives;
        for key in directives.unknown_keys() {
            warn!(key, "Ignoring unknown directive");
        }

        let target = Url::parse(&parsed.clean_url)
            .map_err(|e| ConfigurationError::invalid_url(&parsed.clean_url, e))?;

        let pick = |directive: Option<&str>, fallback: &Option<String>| {
            directive
                .map(str::to_owned)
                .or_else(|| fallback.clone())
                .filter(|v| !v.trim().is_empty())
        };
        let flag = |key: DirectiveKey, fallback: bool| directives.flag(key).unwrap_or(fallback);

        let flags = VariantFlags {
            skip_detection: flag(DirectiveKey::NoVariantCheck, options.no_variant_check),
            force_no_video: flag(DirectiveKey::NoVideo, options.no_video),
            force_no_audio: flag(DirectiveKey::NoAudio, options.no_audio),
        };
        flags.validate()?;

        let request = Self {
            clearkey: pick(directives.clearkey(), &options.clearkey),
            referer: pick(directives.referer(), &options.referer),
            origin: pick(directives.origin(), &options.origin),
            stream: pick(directives.stream(), &options.stream),
            clean_url: parsed.clean_url,
            target,
            user_agent: user_agent.to_string(),
            flags,
            subtitles: options.subtitles,
            extra_headers: options.headers.clone(),
        };

        info!(
            url = %request.clean_url,
            directives = directives.len(),
            "Prepared stream request"
        );
        Ok(request)
    }

    /// Request headers in the order they are sent.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("User-Agent".to_string(), self.user_agent.clone())];
        if let Some(referer) = &self.referer {
            headers.push(("Referer".to_string(), referer.clone()));
        }
        if let Some(origin) = &self.origin {
            headers.push(("Origin".to_string(), origin.clone()));
        }
        headers.extend(self.extra_headers.iter().cloned());
        headers
    }
}

/// Everything the pipeline needs for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRequest {
    pub request: PreparedRequest,
    pub keys: Option<KeySet>,
    pub variant: VariantOutcome,
    pub route: Route,
}

/// Loaded, read-only state shared by every resolution step.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub config: EngineConfig,
    pub keys: KeyDatabase,
    pub policy: ProxyPolicy,
    pub cookies: Option<CookieJar>,
}

impl ResolveContext {
    pub fn new(config: EngineConfig, keys: KeyDatabase, policy: ProxyPolicy) -> Self {
        Self {
            config,
            keys,
            policy,
            cookies: None,
        }
    }

    pub fn with_cookies(mut self, cookies: CookieJar) -> Self {
        self.cookies = Some(cookies);
        self
    }

    /// Fetch stage options for `request`, without the tool path.
    pub fn fetch_command(&self, request: &PreparedRequest) -> FetchCommand {
        let quality = request
            .stream
            .clone()
            .unwrap_or_else(|| self.config.default_quality.clone());

        let mut command = FetchCommand::new(request.clean_url.clone(), quality)
            .log_level(self.config.log_level)
            .segment_threads(self.config.segment_threads)
            .live_edge(self.config.live_edge);

        for (name, value) in request.headers() {
            command = command.header(name, value);
        }

        if let Route::Proxy(proxy) = self.policy.route(RequestKind::MainStream, &request.target) {
            command = command.proxy(proxy);
            if let Some(list) = self.policy.no_proxy_env() {
                command = command.no_proxy(list);
            }
        }

        if let Some(jar) = &self.cookies {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            for cookie in jar.matching(&request.target, now) {
                command = command.cookie(&cookie.name, &cookie.value);
            }
        }

        command
    }

    /// Probe chain for `request`: the fetch tool's stream listing first,
    /// then the manifest itself.
    pub fn variant_engine(&self, request: &PreparedRequest, fetch_program: &Path) -> VariantEngine {
        let listing = ListingProbe::new(fetch_program, self.fetch_command(request).request_args());
        let mut engine = VariantEngine::new(self.config.probe_timeout).with_probe(listing);

        let mut http = self
            .config
            .http_options()
            .with_user_agent(request.user_agent.clone());
        for (name, value) in request.headers().iter().skip(1) {
            http = http.with_header(name, value);
        }
        match RoutedClient::new(&http, self.policy.clone()) {
            Ok(client) => engine = engine.with_probe(ManifestProbe::new(client)),
            Err(e) => warn!(error = %e, "Manifest probe disabled"),
        }
        engine
    }

    pub async fn resolve(
        &self,
        request: PreparedRequest,
        variants: &VariantEngine,
    ) -> Result<ResolvedRequest, ConfigurationError> {
        let keys = keys::resolve(
            &request.clean_url,
            request.clearkey.as_deref(),
            &self.keys,
        );
        match &keys {
            Some(set) => info!(count = set.len(), source = ?set.source(), "Stream is encrypted"),
            None => debug!("No decryption keys for stream"),
        }

        let route = self
            .policy
            .route(RequestKind::MainStream, &request.target);
        let variant = variants.decide(request.flags, &request.target).await?;

        Ok(ResolvedRequest {
            request,
            keys,
            variant,
            route,
        })
    }

    pub fn pipeline_spec(
        &self,
        resolved: &ResolvedRequest,
        fetch_program: &Path,
        mux_program: &Path,
    ) -> PipelineSpec {
        let fetch = self.fetch_command(&resolved.request).build(fetch_program);
        let mux = MuxCommand::new()
            .log_level(self.config.log_level)
            .keys(resolved.keys.clone())
            .variant(resolved.variant)
            .subtitles(resolved.request.subtitles)
            .build(mux_program);
        PipelineSpec { fetch, mux }
    }
}
