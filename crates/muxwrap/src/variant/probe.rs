use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use m3u8_rs::{AlternativeMediaType, MasterPlaylist, MediaPlaylist, Playlist};
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use tokio::process::Command;
use tracing::debug;
use url::Url;

use super::{Presence, TrackSet};
use crate::http::{HttpError, RoutedClient, read_limited};

/// Manifests larger than this are truncated before inspection.
const MANIFEST_LIMIT: usize = 1024 * 1024;

const VIDEO_CODECS: &[&str] = &[
    "avc1", "avc3", "hvc1", "hev1", "dvh1", "dvhe", "vp08", "vp8", "vp09", "vp9", "av01",
];
const AUDIO_CODECS: &[&str] = &["mp4a", "ac-3", "ec-3", "opus", "flac", "mp3", "vorbis", "alac"];
const AUDIO_EXTENSIONS: &[&str] = &[".aac", ".mp3", ".m4a", ".ac3", ".ec3", ".opus", ".flac"];

static AUDIO_STREAM_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(audio_only|audio|a\d+k)$").unwrap());
static VIDEO_STREAM_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+p(\d+)?(_alt\d*)?|\d+x\d+)$").unwrap());
static DASH_TRACK_TYPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:mimeType|contentType)\s*=\s*["'](video|audio)"#).unwrap()
});

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("probe unavailable: {0}")]
    Unavailable(String),

    #[error("unreadable probe output: {0}")]
    Malformed(String),
}

/// A way of learning which tracks a stream carries.
#[async_trait]
pub trait TrackProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn probe(&self, url: &Url) -> Result<TrackSet, ProbeError>;
}

/// Asks the fetch tool which streams it can offer (`--json`).
#[derive(Debug, Clone)]
pub struct ListingProbe {
    program: PathBuf,
    args: Vec<String>,
}

impl ListingProbe {
    /// `args` are the fetch tool's request options (headers, proxy, cookies);
    /// `--json` and the URL are appended per probe.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Classify the stream names of a `--json` listing.
    pub fn classify_listing(document: &str) -> Result<TrackSet, ProbeError> {
        let value: serde_json::Value =
            serde_json::from_str(document).map_err(|e| ProbeError::Malformed(e.to_string()))?;

        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            return Err(ProbeError::Unavailable(error.to_string()));
        }
        let streams = value
            .get("streams")
            .and_then(|s| s.as_object())
            .ok_or_else(|| ProbeError::Malformed("no streams in listing".to_string()))?;

        Ok(classify_stream_names(streams.keys().map(String::as_str)))
    }
}

fn classify_stream_names<'a>(names: impl IntoIterator<Item = &'a str>) -> TrackSet {
    let (mut audio, mut video) = (false, false);
    for name in names {
        audio |= AUDIO_STREAM_NAME.is_match(name);
        video |= VIDEO_STREAM_NAME.is_match(name);
    }

    match (video, audio) {
        (false, true) => TrackSet::new(Presence::Absent, Presence::Present),
        // Listing names never say whether a video stream carries audio.
        (true, _) => TrackSet::new(Presence::Present, Presence::Unknown),
        (false, false) => TrackSet::UNKNOWN,
    }
}

#[async_trait]
impl TrackProbe for ListingProbe {
    fn name(&self) -> &'static str {
        "listing"
    }

    async fn probe(&self, url: &Url) -> Result<TrackSet, ProbeError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--json")
            .arg(url.as_str())
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProbeError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        // The tool reports resolution errors as JSON on stdout with a
        // non-zero status, so the status alone is not decisive.
        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(status = ?output.status, bytes = stdout.len(), "Stream listing finished");
        Self::classify_listing(&stdout)
    }
}

/// Fetches the stream URL and inspects the manifest or content type.
#[derive(Debug, Clone)]
pub struct ManifestProbe {
    client: RoutedClient,
}

impl ManifestProbe {
    pub fn new(client: RoutedClient) -> Self {
        Self { client }
    }

    /// Classify a fetched resource from its body and `Content-Type`.
    pub fn classify(body: &[u8], content_type: Option<&str>) -> TrackSet {
        let text = String::from_utf8_lossy(body);
        let trimmed = text.trim_start_matches('\u{feff}').trim_start();

        if trimmed.starts_with("#EXTM3U") {
            return match m3u8_rs::parse_playlist_res(trimmed.as_bytes()) {
                Ok(Playlist::MasterPlaylist(master)) => classify_master(&master),
                Ok(Playlist::MediaPlaylist(media)) => classify_media(&media),
                Err(e) => {
                    debug!(error = %e, "Unparsable HLS playlist");
                    TrackSet::UNKNOWN
                }
            };
        }
        if trimmed.contains("<MPD") {
            return classify_dash(trimmed);
        }

        let mime = content_type
            .and_then(|c| c.split(';').next())
            .map(|c| c.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if mime.contains("mpegurl") || mime.contains("dash+xml") {
            TrackSet::UNKNOWN
        } else if mime.starts_with("audio/") {
            TrackSet::new(Presence::Absent, Presence::Present)
        } else if mime.starts_with("video/") {
            TrackSet::new(Presence::Present, Presence::Unknown)
        } else {
            TrackSet::UNKNOWN
        }
    }
}

fn codec_kinds(codecs: &str) -> (bool, bool) {
    let (mut video, mut audio) = (false, false);
    for codec in codecs.split(',') {
        let codec = codec.trim().to_ascii_lowercase();
        video |= VIDEO_CODECS.iter().any(|c| codec.starts_with(c));
        audio |= AUDIO_CODECS.iter().any(|c| codec.starts_with(c));
    }
    (video, audio)
}

fn classify_master(master: &MasterPlaylist) -> TrackSet {
    let variants: Vec<_> = master.variants.iter().filter(|v| !v.is_i_frame).collect();
    if variants.is_empty() {
        return TrackSet::UNKNOWN;
    }

    let alt_audio = master
        .alternatives
        .iter()
        .any(|m| m.media_type == AlternativeMediaType::Audio);
    let alt_video = master
        .alternatives
        .iter()
        .any(|m| m.media_type == AlternativeMediaType::Video);

    let mut video = alt_video;
    let mut audio = alt_audio;
    let mut all_have_codecs = true;
    for variant in &variants {
        video |= variant.resolution.is_some() || variant.video.is_some();
        audio |= variant.audio.is_some();
        match &variant.codecs {
            Some(codecs) => {
                let (v, a) = codec_kinds(codecs);
                video |= v;
                audio |= a;
            }
            None => all_have_codecs = false,
        }
    }

    // Absence can only be claimed when every variant declares its codecs.
    let presence = |found: bool| match (found, all_have_codecs) {
        (true, _) => Presence::Present,
        (false, true) => Presence::Absent,
        (false, false) => Presence::Unknown,
    };
    TrackSet::new(presence(video), presence(audio))
}

fn classify_media(media: &MediaPlaylist) -> TrackSet {
    let audio_only = !media.segments.is_empty()
        && media.segments.iter().all(|s| {
            let path = s.uri.split(['?', '#']).next().unwrap_or_default();
            let path = path.to_ascii_lowercase();
            AUDIO_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
        });
    if audio_only {
        TrackSet::new(Presence::Absent, Presence::Present)
    } else {
        TrackSet::UNKNOWN
    }
}

fn classify_dash(manifest: &str) -> TrackSet {
    let (mut video, mut audio) = (false, false);
    for captures in DASH_TRACK_TYPE.captures_iter(manifest) {
        match &captures[1] {
            "video" => video = true,
            "audio" => audio = true,
            _ => {}
        }
    }
    if !video && !audio {
        return TrackSet::UNKNOWN;
    }
    let presence = |found| {
        if found {
            Presence::Present
        } else {
            Presence::Absent
        }
    };
    TrackSet::new(presence(video), presence(audio))
}

#[async_trait]
impl TrackProbe for ManifestProbe {
    fn name(&self) -> &'static str {
        "manifest"
    }

    async fn probe(&self, url: &Url) -> Result<TrackSet, ProbeError> {
        let response = self.client.get(url, None).await?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        // Plain media responses are classified from the header alone.
        let is_media = content_type
            .as_deref()
            .is_some_and(|c| (c.starts_with("audio/") || c.starts_with("video/")) && !c.contains("mpegurl"));
        let body = if is_media {
            Vec::new()
        } else {
            read_limited(response, MANIFEST_LIMIT).await?
        };

        Ok(Self::classify(&body, content_type.as_deref()))
    }
}
