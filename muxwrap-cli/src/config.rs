use std::path::{Path, PathBuf};
use std::time::Duration;

use muxwrap_engine::{EngineConfig, LogLevel, StaticOptions};
use serde::Deserialize;

use crate::cli::CliArgs;
use crate::error::AppError;
use crate::utils::parse_header_pairs;

/// Defaults read from the `--config` TOML file. Every field is optional;
/// command-line options and URL directives take precedence.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub proxy_bypass: Option<String>,
    pub clearkeys: Option<String>,
    pub cookies: Option<PathBuf>,
    pub subtitles: Option<bool>,
    pub loglevel: Option<String>,
    pub log_file: Option<PathBuf>,
    pub install_dir: Option<PathBuf>,
    pub fetch_tool: Option<PathBuf>,
    pub mux_tool: Option<PathBuf>,
    pub default_quality: Option<String>,
    pub probe_timeout_secs: Option<u64>,
    pub grace_period_secs: Option<u64>,
    pub headers: Vec<String>,
}

impl FileConfig {
    /// Load configuration from a TOML file. An explicitly named file that
    /// does not exist is an error.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::ConfigFile(format!("{}: {e}", path.display())))?;
        Self::parse(&content)
            .map_err(|e| AppError::ConfigFile(format!("{}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// Effective settings for one run, after merging CLI and file config.
#[derive(Debug, Clone)]
pub struct Settings {
    pub input_url: String,
    pub user_agent: String,
    pub proxy: Option<String>,
    pub proxy_bypass: Option<String>,
    pub clearkeys: Option<String>,
    pub cookies: Option<PathBuf>,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
    /// Static options, except headers.
    pub options: StaticOptions,
    /// `Name: Value` lines from the file, then the command line.
    pub header_lines: Vec<String>,
    pub engine: EngineConfig,
}

impl Settings {
    pub fn merge(args: CliArgs, file: FileConfig) -> Result<Self, AppError> {
        let input_url = args
            .input
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AppError::Usage("missing input URL (-i)".to_string()))?;
        let user_agent = args
            .user_agent
            .or(file.user_agent)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AppError::Usage("missing user agent (-ua)".to_string()))?;

        let log_level = match args.loglevel.or(file.loglevel) {
            Some(level) => level.parse::<LogLevel>()?,
            None => LogLevel::default(),
        };

        let mut header_lines = file.headers;
        header_lines.extend(args.headers);

        let options = StaticOptions {
            clearkey: args.clearkey,
            referer: args.referer,
            origin: args.origin,
            stream: args.stream,
            no_variant_check: args.no_variant_check,
            no_audio: args.no_audio,
            no_video: args.no_video,
            subtitles: args.subtitles || file.subtitles.unwrap_or(false),
            headers: Vec::new(),
        };

        let mut builder = EngineConfig::builder()
            .with_user_agent(user_agent.clone())
            .with_log_level(log_level);
        if let Some(dir) = args.install_dir.or(file.install_dir) {
            builder = builder.with_install_dir(dir);
        }
        if let Some(path) = args.fetch_tool.or(file.fetch_tool) {
            builder = builder.with_fetch_tool_path(path);
        }
        if let Some(path) = args.mux_tool.or(file.mux_tool) {
            builder = builder.with_mux_tool_path(path);
        }
        if let Some(quality) = file.default_quality {
            builder = builder.with_default_quality(quality);
        }
        if let Some(secs) = args.probe_timeout.or(file.probe_timeout_secs) {
            builder = builder.with_probe_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = file.grace_period_secs {
            builder = builder.with_grace_period(Duration::from_secs(secs));
        }

        Ok(Self {
            input_url,
            user_agent,
            proxy: args.proxy.or(file.proxy),
            proxy_bypass: args.proxy_bypass.or(file.proxy_bypass),
            clearkeys: args.clearkeys.or(file.clearkeys),
            cookies: args.cookies.or(file.cookies),
            log_level,
            log_file: args.log_file.or(file.log_file),
            options,
            header_lines,
            engine: builder.build(),
        })
    }

    /// Static options with the header lines parsed. Invalid lines are
    /// logged and skipped, so call this once logging is up.
    pub fn static_options(&self) -> StaticOptions {
        StaticOptions {
            headers: parse_header_pairs(&self.header_lines),
            ..self.options.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FILE: &str = r#"
        user_agent = "FileAgent/1.0"
        proxy = "http://file-proxy:3128"
        proxy_bypass = ".lan"
        loglevel = "WARNING"
        subtitles = true
        probe_timeout_secs = 5
        headers = ["X-From-File: 1"]
    "#;

    fn args() -> CliArgs {
        CliArgs {
            input: Some("https://x/a.m3u8".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_file_values_fill_gaps() {
        let file = FileConfig::parse(FILE).unwrap();
        let settings = Settings::merge(args(), file).unwrap();

        assert_eq!(settings.user_agent, "FileAgent/1.0");
        assert_eq!(settings.proxy.as_deref(), Some("http://file-proxy:3128"));
        assert_eq!(settings.log_level, LogLevel::Warning);
        assert!(settings.options.subtitles);
        assert_eq!(settings.engine.probe_timeout, Duration::from_secs(5));
        assert!(settings.options.headers.is_empty());
        assert_eq!(
            settings.static_options().headers,
            [("X-From-File".to_string(), "1".to_string())]
        );
    }

    #[test]
    fn test_header_lines_parsed_on_demand() {
        let cli = CliArgs {
            user_agent: Some("VLC/3.0".to_string()),
            headers: vec!["X-Token: abc".to_string(), "no separator".to_string()],
            ..args()
        };
        let file = FileConfig {
            headers: vec!["X-From-File: 1".to_string()],
            ..Default::default()
        };
        let settings = Settings::merge(cli, file).unwrap();
        assert_eq!(
            settings.header_lines,
            ["X-From-File: 1", "X-Token: abc", "no separator"]
        );
        assert_eq!(
            settings.static_options().headers,
            [
                ("X-From-File".to_string(), "1".to_string()),
                ("X-Token".to_string(), "abc".to_string()),
            ]
        );
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = FileConfig::parse(FILE).unwrap();
        let cli = CliArgs {
            user_agent: Some("VLC/3.0".to_string()),
            proxy: Some("http://cli-proxy:8080".to_string()),
            loglevel: Some("DEBUG".to_string()),
            probe_timeout: Some(1),
            ..args()
        };
        let settings = Settings::merge(cli, file).unwrap();
        assert_eq!(settings.user_agent, "VLC/3.0");
        assert_eq!(settings.engine.user_agent, "VLC/3.0");
        assert_eq!(settings.proxy.as_deref(), Some("http://cli-proxy:8080"));
        assert_eq!(settings.proxy_bypass.as_deref(), Some(".lan"));
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.engine.probe_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_required_values() {
        assert!(matches!(
            Settings::merge(CliArgs::default(), FileConfig::default()),
            Err(AppError::Usage(_))
        ));
        assert!(matches!(
            Settings::merge(args(), FileConfig::default()),
            Err(AppError::Usage(_))
        ));
    }

    #[test]
    fn test_bad_loglevel_is_config_error() {
        let cli = CliArgs {
            user_agent: Some("VLC/3.0".to_string()),
            loglevel: Some("LOUD".to_string()),
            ..args()
        };
        let err = Settings::merge(cli, FileConfig::default()).unwrap_err();
        assert_eq!(err.exit_code(), 22);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("muxwrap.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(FILE.as_bytes())
            .unwrap();
        assert!(FileConfig::load(&path).is_ok());

        assert!(matches!(
            FileConfig::load(&dir.path().join("missing.toml")),
            Err(AppError::ConfigFile(_))
        ));
        assert!(FileConfig::parse("unknown_key = 1").is_err());
    }
}
