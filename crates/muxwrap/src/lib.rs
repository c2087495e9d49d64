//! # Muxwrap engine
//!
//! Resolution and orchestration layer that sits between a channel host and
//! the external fetch/mux tools. Given a raw input URL (optionally decorated
//! with `#key=value&...` directives) and a user agent it:
//!
//! - strips the directives and produces the clean request URL
//! - resolves decryption keys from the directives or a key database
//! - decides per request whether the configured proxy applies
//! - decides whether a synthetic audio or video track has to be muxed in
//! - runs the fetch stage and the mux stage as two connected processes and
//!   forwards the muxed output to a sink
//!
//! Container/codec handling, DRM cryptography and segment fetching are left
//! to the external tools.

pub mod builder;
pub mod config;
pub mod cookies;
pub mod directive;
pub mod error;
pub mod http;
pub mod keys;
pub mod pipeline;
pub mod proxy;
pub mod request;
pub mod variant;

pub use builder::EngineConfigBuilder;
pub use config::{EngineConfig, LogLevel, ToolConfig};
pub use cookies::CookieJar;
pub use directive::{DirectiveKey, Directives, ParsedUrl};
pub use error::ConfigurationError;
pub use keys::{DatabaseLocation, KeyDatabase, KeyPair, KeySet, KeySource};
pub use pipeline::{
    EndReason, FailureReport, Pipeline, PipelineError, PipelineOutcome, PipelineSpec,
    PipelineState, StageKind,
};
pub use proxy::{BypassPattern, ProxyPolicy, RequestKind, Route};
pub use request::{PreparedRequest, RawRequest, ResolveContext, ResolvedRequest, StaticOptions};
pub use variant::{TrackSet, VariantEngine, VariantFlags, VariantOutcome};
