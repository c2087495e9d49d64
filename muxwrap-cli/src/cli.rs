use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;

/// Single-dash long options understood for compatibility with existing
/// channel profiles, and their `--` spelling.
const LEGACY_OPTIONS: &[(&str, &str)] = &[
    ("-ua", "--user-agent"),
    ("-proxy", "--proxy"),
    ("-proxybypass", "--proxy-bypass"),
    ("-clearkeys", "--clearkeys"),
    ("-clearkey", "--clearkey"),
    ("-cookies", "--cookies"),
    ("-subtitles", "--subtitles"),
    ("-loglevel", "--loglevel"),
    ("-novariantcheck", "--novariantcheck"),
    ("-noaudio", "--noaudio"),
    ("-novideo", "--novideo"),
    ("-stream", "--stream"),
    ("-referer", "--referer"),
    ("-origin", "--origin"),
];

/// Define CLI arguments
#[derive(Parser, Debug, Default)]
#[command(
    name = "muxwrap",
    version,
    about = "Resolve a stream URL and pipe it through the fetch and mux tools",
    long_about = "Resolves a stream URL for a channel host and runs the fetch tool and the mux tool\n\
                  as a connected pipeline, writing MPEG-TS to stdout.\n\
                  \n\
                  Per-channel options can be appended to the URL as a trailing fragment:\n\
                  https://cdn.example/live.mpd#clearkey=KID:KEY&referer=https://site/\n\
                  Recognised directives: clearkey, referer, origin, stream, novariantcheck,\n\
                  noaudio, novideo. Directives override the matching command-line options."
)]
pub struct CliArgs {
    /// Input URL, optionally carrying #key=value directives
    #[arg(short = 'i', long = "input", env = "MUXWRAP_INPUT")]
    pub input: Option<String>,

    /// User agent for every request
    #[arg(long = "user-agent", env = "MUXWRAP_USER_AGENT")]
    pub user_agent: Option<String>,

    /// HTTP proxy for stream requests
    #[arg(long, env = "MUXWRAP_PROXY")]
    pub proxy: Option<String>,

    /// Comma-separated hosts that bypass the proxy (host, host:port, .domain)
    #[arg(long = "proxy-bypass", env = "MUXWRAP_PROXY_BYPASS")]
    pub proxy_bypass: Option<String>,

    /// Key database: JSON file (relative to the install directory) or http(s) URL
    #[arg(long = "clearkeys", env = "MUXWRAP_CLEARKEYS")]
    pub clearkeys: Option<String>,

    /// Decryption key(s) as KEY or KID:KEY, comma-separated
    #[arg(long)]
    pub clearkey: Option<String>,

    /// Referer header
    #[arg(long)]
    pub referer: Option<String>,

    /// Origin header
    #[arg(long)]
    pub origin: Option<String>,

    /// Quality selector passed to the fetch tool
    #[arg(long)]
    pub stream: Option<String>,

    /// Netscape cookie jar (relative to the install directory)
    #[arg(long, env = "MUXWRAP_COOKIES")]
    pub cookies: Option<PathBuf>,

    /// Keep subtitle streams
    #[arg(long)]
    pub subtitles: bool,

    /// Skip audio/video variant detection
    #[arg(long = "novariantcheck")]
    pub no_variant_check: bool,

    /// Treat the stream as having no audio and mux in silence
    #[arg(long = "noaudio")]
    pub no_audio: bool,

    /// Treat the stream as having no video and mux in a blank picture
    #[arg(long = "novideo")]
    pub no_video: bool,

    /// Extra request header in "Name: Value" form (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// Log level: CRITICAL, ERROR, WARNING, INFO, DEBUG or NOTSET
    #[arg(long, env = "MUXWRAP_LOGLEVEL")]
    pub loglevel: Option<String>,

    /// Also write logs to this file
    #[arg(long = "log-file", env = "MUXWRAP_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short = 'c', long, env = "MUXWRAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Base directory for relative key database and cookie paths
    #[arg(long = "install-dir", env = "MUXWRAP_INSTALL_DIR")]
    pub install_dir: Option<PathBuf>,

    /// Fetch tool executable (default: streamlink on PATH)
    #[arg(long = "fetch-tool", env = "MUXWRAP_FETCH_TOOL")]
    pub fetch_tool: Option<PathBuf>,

    /// Mux tool executable (default: ffmpeg on PATH)
    #[arg(long = "mux-tool", env = "MUXWRAP_MUX_TOOL")]
    pub mux_tool: Option<PathBuf>,

    /// Upper bound in seconds for variant detection
    #[arg(long = "probe-timeout")]
    pub probe_timeout: Option<u64>,
}

/// Rewrite legacy single-dash long options to their `--` form. Everything
/// after a bare `--` is left alone.
pub fn normalize_legacy_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut passthrough = false;
    args.into_iter()
        .map(|arg| {
            if passthrough {
                return arg;
            }
            if arg == "--" {
                passthrough = true;
                return arg;
            }
            match arg.to_str() {
                Some(text) => LEGACY_OPTIONS
                    .iter()
                    .find(|(legacy, _)| *legacy == text)
                    .map(|(_, modern)| OsString::from(*modern))
                    .unwrap_or(arg),
                None => arg,
            }
        })
        .collect()
}

/// Parse process arguments, accepting the legacy option spellings.
pub fn parse_args<I>(args: I) -> Result<CliArgs, clap::Error>
where
    I: IntoIterator<Item = OsString>,
{
    CliArgs::try_parse_from(normalize_legacy_args(args))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        parse_args(args.iter().map(OsString::from)).unwrap()
    }

    #[test]
    fn test_legacy_options() {
        let args = parse(&[
            "muxwrap",
            "-i",
            "https://x/a.m3u8",
            "-ua",
            "VLC/3.0",
            "-proxy",
            "http://proxy:8080",
            "-proxybypass",
            ".example.com",
            "-clearkeys",
            "clearkeys.json",
            "-subtitles",
            "-loglevel",
            "DEBUG",
            "-novariantcheck",
        ]);
        assert_eq!(args.input.as_deref(), Some("https://x/a.m3u8"));
        assert_eq!(args.user_agent.as_deref(), Some("VLC/3.0"));
        assert_eq!(args.proxy_bypass.as_deref(), Some(".example.com"));
        assert_eq!(args.clearkeys.as_deref(), Some("clearkeys.json"));
        assert!(args.subtitles);
        assert!(args.no_variant_check);
        assert_eq!(args.loglevel.as_deref(), Some("DEBUG"));
    }

    #[test]
    fn test_modern_options_and_headers() {
        let args = parse(&[
            "muxwrap",
            "--input",
            "https://x/a.m3u8",
            "--user-agent",
            "VLC/3.0",
            "-H",
            "X-Token: abc",
            "--header",
            "X-Other: def",
            "--novideo",
        ]);
        assert_eq!(args.headers, ["X-Token: abc", "X-Other: def"]);
        assert!(args.no_video);
    }

    #[test]
    fn test_values_are_not_rewritten_after_separator() {
        let normalized = normalize_legacy_args(
            ["muxwrap", "-ua", "x", "--", "-ua"].map(OsString::from),
        );
        assert_eq!(normalized[1], "--user-agent");
        assert_eq!(normalized[4], "-ua");
    }

    #[test]
    fn test_unknown_option_is_an_error() {
        assert!(parse_args(["muxwrap", "--bogus"].map(OsString::from)).is_err());
    }
}
