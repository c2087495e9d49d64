use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::error::ConfigurationError;
use crate::http::{DEFAULT_USER_AGENT, HttpOptions};

/// MPEG-TS packet size times 64.
pub const DEFAULT_CHUNK_SIZE: usize = 188 * 64;

pub const DEFAULT_QUALITY: &str = "best,live";

/// An external tool, found on `PATH` unless given an explicit path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub name: String,
    pub path: Option<PathBuf>,
}

impl ToolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Locate the executable.
    pub fn resolve(&self) -> Result<PathBuf, ConfigurationError> {
        let target = self
            .path
            .as_deref()
            .unwrap_or_else(|| Path::new(&self.name));
        let resolved = which::which(target).map_err(|e| ConfigurationError::ToolNotFound {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        debug!(tool = %self.name, path = %resolved.display(), "Resolved tool");
        Ok(resolved)
    }
}

/// Log verbosity, shared by the wrapper and both tools.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
    NotSet,
}

impl LogLevel {
    /// Spelling understood by the fetch tool.
    pub fn fetch_level(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::NotSet => "none",
        }
    }

    /// Spelling understood by the mux tool.
    pub fn mux_level(self) -> &'static str {
        match self {
            Self::Critical => "fatal",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::NotSet => "quiet",
        }
    }

    /// `tracing` directive for this level; `None` for [`LogLevel::NotSet`].
    pub fn tracing_directive(self) -> Option<&'static str> {
        match self {
            Self::Critical | Self::Error => Some("error"),
            Self::Warning => Some("warn"),
            Self::Info => Some("info"),
            Self::Debug => Some("debug"),
            Self::NotSet => None,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" | "FATAL" => Ok(Self::Critical),
            "ERROR" => Ok(Self::Error),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "INFO" => Ok(Self::Info),
            "DEBUG" | "TRACE" => Ok(Self::Debug),
            "NOTSET" | "NONE" | "OFF" => Ok(Self::NotSet),
            other => Err(ConfigurationError::invalid_option(
                "loglevel",
                format!("unknown level '{other}'"),
            )),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Critical => "CRITICAL",
            Self::Error => "ERROR",
            Self::Warning => "WARNING",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::NotSet => "NOTSET",
        })
    }
}

/// Engine-wide settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fetch stage tool
    pub fetch_tool: ToolConfig,

    /// Mux stage tool
    pub mux_tool: ToolConfig,

    /// Verbosity passed down to both tools
    pub log_level: LogLevel,

    /// User agent for probes and the key database fetch
    pub user_agent: String,

    /// Timeout for a single HTTP request
    pub http_timeout: Duration,

    /// Connect timeout for HTTP requests
    pub connect_timeout: Duration,

    /// Upper bound for the whole variant probe chain
    pub probe_timeout: Duration,

    /// Time a stage gets to exit after SIGTERM before it is killed
    pub grace_period: Duration,

    /// Size of each chunk forwarded to the sink
    pub chunk_size: usize,

    /// Segment download threads for the fetch tool
    pub segment_threads: u32,

    /// Live edge, in segments, for HLS streams
    pub live_edge: u32,

    /// Quality selector used when no `stream` option is given
    pub default_quality: String,

    /// Base for relative key database and cookie jar paths
    pub install_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_tool: ToolConfig::new("streamlink"),
            mux_tool: ToolConfig::new("ffmpeg"),
            log_level: LogLevel::default(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            http_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(15),
            grace_period: Duration::from_secs(5),
            chunk_size: DEFAULT_CHUNK_SIZE,
            segment_threads: 4,
            live_edge: 6,
            default_quality: DEFAULT_QUALITY.to_owned(),
            install_dir: default_install_dir(),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> crate::builder::EngineConfigBuilder {
        crate::builder::EngineConfigBuilder::new()
    }

    /// HTTP options derived from this config.
    pub fn http_options(&self) -> HttpOptions {
        HttpOptions {
            user_agent: self.user_agent.clone(),
            timeout: self.http_timeout,
            connect_timeout: self.connect_timeout,
            ..HttpOptions::default()
        }
    }
}

/// `path` itself when absolute, otherwise `path` under `install_dir`.
pub fn resolve_install_path(install_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        install_dir.join(path)
    }
}

/// Directory holding the running executable, or the working directory when
/// that cannot be determined.
pub fn default_install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}
