//! # Variant decision
//!
//! Decides whether the stream is missing its audio or video track and a
//! synthetic one has to be muxed in. Explicit flags short-circuit probing:
//!
//! 1. `force_no_video` → [`VariantOutcome::MuxBlankVideo`]
//! 2. `force_no_audio` → [`VariantOutcome::MuxSilentAudio`]
//! 3. `skip_detection` → [`VariantOutcome::PassThrough`]
//!
//! Otherwise the configured [`TrackProbe`]s run in order until the track set
//! is fully known. Probe failures and timeouts never fail the request; they
//! degrade to pass-through.

mod probe;

pub use probe::{ListingProbe, ManifestProbe, ProbeError, TrackProbe};

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};
use url::Url;

use crate::error::ConfigurationError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariantFlags {
    pub skip_detection: bool,
    pub force_no_video: bool,
    pub force_no_audio: bool,
}

impl VariantFlags {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.force_no_video && self.force_no_audio {
            return Err(ConfigurationError::Conflict(
                "novideo and noaudio cannot both be set".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantOutcome {
    PassThrough,
    MuxBlankVideo,
    MuxSilentAudio,
}

impl fmt::Display for VariantOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PassThrough => "pass-through",
            Self::MuxBlankVideo => "mux blank video",
            Self::MuxSilentAudio => "mux silent audio",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
    #[default]
    Unknown,
}

impl Presence {
    fn or(self, other: Self) -> Self {
        match self {
            Self::Unknown => other,
            known => known,
        }
    }
}

/// What a probe learned about the stream's tracks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackSet {
    pub video: Presence,
    pub audio: Presence,
}

impl TrackSet {
    pub const UNKNOWN: Self = Self {
        video: Presence::Unknown,
        audio: Presence::Unknown,
    };

    pub fn new(video: Presence, audio: Presence) -> Self {
        Self { video, audio }
    }

    pub fn is_conclusive(&self) -> bool {
        self.video != Presence::Unknown && self.audio != Presence::Unknown
    }

    /// Fill unknown fields from `other`; known fields are kept.
    pub fn merge(self, other: Self) -> Self {
        Self {
            video: self.video.or(other.video),
            audio: self.audio.or(other.audio),
        }
    }

    pub fn outcome(&self) -> VariantOutcome {
        match (self.video, self.audio) {
            (Presence::Absent, Presence::Present) => VariantOutcome::MuxBlankVideo,
            (Presence::Present, Presence::Absent) => VariantOutcome::MuxSilentAudio,
            (Presence::Present, Presence::Present) => VariantOutcome::PassThrough,
            (video, audio) => {
                warn!(?video, ?audio, "No conclusive track information, passing stream through");
                VariantOutcome::PassThrough
            }
        }
    }
}

/// Ordered probe chain bounded by an overall timeout.
pub struct VariantEngine {
    probes: Vec<Box<dyn TrackProbe>>,
    timeout: Duration,
}

impl VariantEngine {
    pub fn new(timeout: Duration) -> Self {
        Self {
            probes: Vec::new(),
            timeout,
        }
    }

    pub fn with_probe(mut self, probe: impl TrackProbe + 'static) -> Self {
        self.probes.push(Box::new(probe));
        self
    }

    pub fn probe_names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    pub async fn decide(
        &self,
        flags: VariantFlags,
        url: &Url,
    ) -> Result<VariantOutcome, ConfigurationError> {
        flags.validate()?;

        let outcome = if flags.force_no_video {
            VariantOutcome::MuxBlankVideo
        } else if flags.force_no_audio {
            VariantOutcome::MuxSilentAudio
        } else if flags.skip_detection {
            VariantOutcome::PassThrough
        } else {
            match tokio::time::timeout(self.timeout, self.detect(url)).await {
                Ok(tracks) => tracks.outcome(),
                Err(_) => {
                    warn!(timeout = ?self.timeout, "Variant detection timed out, passing stream through");
                    VariantOutcome::PassThrough
                }
            }
        };

        info!(%outcome, "Variant decision");
        Ok(outcome)
    }

    async fn detect(&self, url: &Url) -> TrackSet {
        let mut tracks = TrackSet::UNKNOWN;
        for probe in &self.probes {
            match probe.probe(url).await {
                Ok(found) => {
                    debug!(probe = probe.name(), ?found, "Probe finished");
                    tracks = tracks.merge(found);
                    if tracks.is_conclusive() {
                        break;
                    }
                }
                Err(e) => warn!(probe = probe.name(), error = %e, "Probe failed"),
            }
        }
        tracks
    }
}

impl fmt::Debug for VariantEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariantEngine")
            .field("probes", &self.probe_names())
            .field("timeout", &self.timeout)
            .finish()
    }
}
