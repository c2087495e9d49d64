//! # Builder for EngineConfig
//!
//! Fluent construction of [`EngineConfig`] values.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use muxwrap_engine::EngineConfig;
//!
//! let config = EngineConfig::builder()
//!     .with_user_agent("VLC/3.0.20 LibVLC/3.0.20")
//!     .with_fetch_tool_path("/usr/local/bin/streamlink")
//!     .with_probe_timeout(Duration::from_secs(5))
//!     .with_install_dir("/opt/muxwrap")
//!     .build();
//!
//! assert_eq!(config.probe_timeout, Duration::from_secs(5));
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{EngineConfig, LogLevel, ToolConfig};

/// Builder for creating EngineConfig instances with a fluent API
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    /// Replace the fetch tool
    pub fn with_fetch_tool(mut self, tool: ToolConfig) -> Self {
        self.config.fetch_tool = tool;
        self
    }

    /// Use an explicit executable for the fetch tool
    pub fn with_fetch_tool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.fetch_tool.path = Some(path.into());
        self
    }

    /// Replace the mux tool
    pub fn with_mux_tool(mut self, tool: ToolConfig) -> Self {
        self.config.mux_tool = tool;
        self
    }

    /// Use an explicit executable for the mux tool
    pub fn with_mux_tool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.mux_tool.path = Some(path.into());
        self
    }

    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// Set the user agent used for probes and key database fetches
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the timeout for a single HTTP request
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.config.http_timeout = timeout;
        self
    }

    /// Set the HTTP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the upper bound for the whole variant probe chain
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.config.probe_timeout = timeout;
        self
    }

    /// Set how long a stage may take to exit after SIGTERM
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.config.grace_period = grace;
        self
    }

    /// Set the output chunk size; zero keeps the current value
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.config.chunk_size = size;
        }
        self
    }

    pub fn with_segment_threads(mut self, threads: u32) -> Self {
        self.config.segment_threads = threads;
        self
    }

    pub fn with_live_edge(mut self, segments: u32) -> Self {
        self.config.live_edge = segments;
        self
    }

    /// Set the quality selector used when none is requested
    pub fn with_default_quality(mut self, quality: impl Into<String>) -> Self {
        self.config.default_quality = quality.into();
        self
    }

    /// Set the base directory for relative key database and cookie paths
    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.install_dir = dir.into();
        self
    }

    /// Build the final configuration
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
