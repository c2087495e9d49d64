//! Argument builders for the fetch and mux stages.

use std::fmt;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use tokio::process::Command;
use tracing::warn;
use url::Url;

use crate::config::LogLevel;
use crate::keys::{KeyPair, KeySet};
use crate::variant::VariantOutcome;

const BLANK_VIDEO_SOURCE: &str = "color=c=black:s=1280x720:r=25";
const SILENT_AUDIO_SOURCE: &str = "anullsrc=channel_layout=stereo:sample_rate=48000";

/// A fully built process invocation.
#[derive(Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl StageCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)));
        command
    }
}

// Key material must never reach the logs.
impl fmt::Debug for StageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut redact_next = false;
        let args: Vec<&str> = self
            .args
            .iter()
            .map(|arg| {
                let shown = if redact_next { "<redacted>" } else { arg.as_str() };
                redact_next = arg.starts_with("-decryption_key");
                shown
            })
            .collect();
        f.debug_struct("StageCommand")
            .field("program", &self.program)
            .field("args", &args)
            .field("env", &self.env)
            .finish()
    }
}

/// Builder for the fetch stage (streamlink-compatible options).
#[derive(Debug, Clone)]
pub struct FetchCommand {
    url: String,
    quality: String,
    log_level: LogLevel,
    headers: Vec<(String, String)>,
    proxy: Option<Url>,
    no_proxy: Option<String>,
    cookies: Vec<(String, String)>,
    segment_threads: u32,
    live_edge: u32,
}

impl FetchCommand {
    pub fn new(url: impl Into<String>, quality: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            quality: quality.into(),
            log_level: LogLevel::default(),
            headers: Vec::new(),
            proxy: None,
            no_proxy: None,
            cookies: Vec::new(),
            segment_threads: 4,
            live_edge: 6,
        }
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Bypass list exported as `NO_PROXY` for the tool's own sub-requests.
    pub fn no_proxy(mut self, list: impl Into<String>) -> Self {
        self.no_proxy = Some(list.into());
        self
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn segment_threads(mut self, threads: u32) -> Self {
        self.segment_threads = threads;
        self
    }

    pub fn live_edge(mut self, segments: u32) -> Self {
        self.live_edge = segments;
        self
    }

    /// Options describing how to reach the stream: headers, proxy, cookies.
    pub fn request_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (name, value) in &self.headers {
            args.push("--http-header".to_string());
            args.push(format!("{name}={value}"));
        }
        if let Some(proxy) = &self.proxy {
            args.push("--http-proxy".to_string());
            args.push(proxy.to_string());
        }
        for (name, value) in &self.cookies {
            args.push("--http-cookie".to_string());
            args.push(format!("{name}={value}"));
        }
        args
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "--stdout".to_string(),
            "--loglevel".to_string(),
            self.log_level.fetch_level().to_string(),
        ];
        args.extend(self.request_args());
        args.extend([
            "--stream-segment-threads".to_string(),
            self.segment_threads.to_string(),
            "--hls-live-edge".to_string(),
            self.live_edge.to_string(),
            self.url.clone(),
            self.quality.clone(),
        ]);
        args
    }

    pub fn build(&self, program: impl Into<PathBuf>) -> StageCommand {
        let mut command = StageCommand::new(program).args(self.build_args());
        if let Some(list) = &self.no_proxy {
            command = command.env("NO_PROXY", list).env("no_proxy", list);
        }
        command
    }
}

/// Builder for the mux stage (ffmpeg-compatible options). Reads the fetch
/// output from `pipe:0` and writes MPEG-TS to `pipe:1`.
#[derive(Debug, Clone)]
pub struct MuxCommand {
    log_level: LogLevel,
    keys: Option<KeySet>,
    variant: VariantOutcome,
    subtitles: bool,
}

impl MuxCommand {
    pub fn new() -> Self {
        Self {
            log_level: LogLevel::default(),
            keys: None,
            variant: VariantOutcome::PassThrough,
            subtitles: false,
        }
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn keys(mut self, keys: Option<KeySet>) -> Self {
        self.keys = keys;
        self
    }

    pub fn variant(mut self, variant: VariantOutcome) -> Self {
        self.variant = variant;
        self
    }

    pub fn subtitles(mut self, enabled: bool) -> Self {
        self.subtitles = enabled;
        self
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            self.log_level.mux_level().into(),
        ];

        if let Some(keys) = &self.keys {
            args.push("-copyts".into());
            args.extend(decryption_args(keys.keys()));
        }
        args.extend(["-i".into(), "pipe:0".into()]);

        match self.variant {
            VariantOutcome::PassThrough => {
                args.extend(["-map", "0:v?", "-map", "0:a?"].map(String::from));
                self.push_subtitle_map(&mut args);
                args.extend(["-c:v", "copy", "-c:a", "copy"].map(String::from));
            }
            VariantOutcome::MuxBlankVideo => {
                args.extend(["-f", "lavfi", "-i", BLANK_VIDEO_SOURCE].map(String::from));
                args.extend(["-map", "1:v:0", "-map", "0:a"].map(String::from));
                self.push_subtitle_map(&mut args);
                args.extend(
                    [
                        "-c:v", "libx264", "-preset", "ultrafast", "-tune", "stillimage",
                        "-pix_fmt", "yuv420p", "-c:a", "copy", "-shortest",
                    ]
                    .map(String::from),
                );
            }
            VariantOutcome::MuxSilentAudio => {
                args.extend(["-f", "lavfi", "-i", SILENT_AUDIO_SOURCE].map(String::from));
                args.extend(["-map", "0:v", "-map", "1:a:0"].map(String::from));
                self.push_subtitle_map(&mut args);
                args.extend(
                    ["-c:v", "copy", "-c:a", "aac", "-b:a", "128k", "-shortest"].map(String::from),
                );
            }
        }

        if self.subtitles {
            args.extend(["-c:s".into(), "copy".into()]);
        }

        args.extend(["-f".into(), "mpegts".into()]);
        if self.keys.is_some() {
            args.extend(["-mpegts_copyts".into(), "1".into()]);
        }
        args.push("pipe:1".into());
        args
    }

    fn push_subtitle_map(&self, args: &mut Vec<String>) {
        if self.subtitles {
            args.extend(["-map".into(), "0:s?".into()]);
        }
    }

    pub fn build(&self, program: impl Into<PathBuf>) -> StageCommand {
        StageCommand::new(program).args(self.build_args())
    }
}

impl Default for MuxCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Decryption options for the mux stage.
fn decryption_args(keys: &[KeyPair]) -> Vec<String> {
    if let [single] = keys {
        return vec!["-decryption_key".into(), normalize_key(&single.key)];
    }

    let mut args = Vec::new();
    let with_kid: Vec<String> = keys
        .iter()
        .filter_map(|pair| {
            let kid = pair.kid.as_deref()?;
            Some(format!("{}={}", normalize_key(kid), normalize_key(&pair.key)))
        })
        .collect();
    if !with_kid.is_empty() {
        args.push("-decryption_keys".into());
        args.push(with_kid.join(","));
    }
    if let Some(bare) = keys.iter().find(|pair| pair.kid.is_none()) {
        args.push("-decryption_key".into());
        args.push(normalize_key(&bare.key));
    }
    args
}

/// Convert base64 key material (21–24 characters) to hex. Values that are
/// already 32 hex digits pass through; anything else is forwarded as given.
pub fn normalize_key(value: &str) -> String {
    let value = value.trim();
    if is_hex_key(value) {
        return value.to_ascii_lowercase();
    }

    if (21..=24).contains(&value.len()) {
        let decoded = URL_SAFE_NO_PAD
            .decode(value.trim_end_matches('='))
            .or_else(|_| URL_SAFE.decode(value))
            .or_else(|_| STANDARD.decode(value));
        if let Ok(bytes) = decoded {
            let hex = hex::encode(bytes);
            if is_hex_key(&hex) {
                return hex;
            }
        }
    }

    warn!(length = value.len(), "Key is not 32 hex digits, forwarding unchanged");
    value.to_string()
}

fn is_hex_key(value: &str) -> bool {
    value.len() == 32 && value.bytes().all(|b| b.is_ascii_hexdigit())
}
