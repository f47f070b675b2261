//! Topology planning for a single transcoder run.
//!
//! Given which media classes a stream has, this decides how the output's
//! video and audio tracks are produced: which manifest inputs exist, whether
//! a synthetic source (silence or a black canvas) fills the missing track,
//! and what filter graph and stream mappings tie them together.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How the output tracks are sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Video manifest plus audio manifest.
    Both,
    /// Video manifest only; its embedded audio, if any, passes through.
    VideoOnly,
    /// Video manifest containing stills and no audio manifest. Stills carry no
    /// audio track, so silence is synthesized and the frame rate is pinned.
    VideoWithStills,
    /// Audio manifest only, over a synthesized black canvas.
    AudioOnly,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Both => write!(f, "both"),
            Topology::VideoOnly => write!(f, "video_only"),
            Topology::VideoWithStills => write!(f, "video_with_stills"),
            Topology::AudioOnly => write!(f, "audio_only"),
        }
    }
}

/// Planning failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("stream has neither video nor audio media")]
    NoMedia,
}

/// Chooses the topology for the media a stream has.
///
/// `has_stills` only matters when there is video and no audio.
pub fn plan(has_video: bool, has_audio: bool, has_stills: bool) -> Result<Topology, PlanError> {
    match (has_video, has_audio) {
        (true, true) => Ok(Topology::Both),
        (true, false) if has_stills => Ok(Topology::VideoWithStills),
        (true, false) => Ok(Topology::VideoOnly),
        (false, true) => Ok(Topology::AudioOnly),
        (false, false) => Err(PlanError::NoMedia),
    }
}

/// Output canvas parameters the graph is built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputGeometry {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub sample_rate: u32,
}

impl Default for OutputGeometry {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
            sample_rate: 44100,
        }
    }
}

/// A generated input standing in for a missing track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntheticSource {
    /// Stereo silence.
    Silence { sample_rate: u32 },
    /// Solid black video.
    Filler {
        width: u32,
        height: u32,
        frame_rate: u32,
    },
}

impl SyntheticSource {
    /// The lavfi source expression.
    pub fn lavfi_expr(&self) -> String {
        match self {
            SyntheticSource::Silence { sample_rate } => {
                format!("anullsrc=channel_layout=stereo:sample_rate={}", sample_rate)
            }
            SyntheticSource::Filler {
                width,
                height,
                frame_rate,
            } => format!("color=c=black:s={}x{}:r={}", width, height, frame_rate),
        }
    }
}

/// Filter graph and output mappings for one topology.
///
/// Input indices follow a fixed order: the video manifest (if any), then the
/// audio manifest (if any), then the synthetic source (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeGraph {
    pub topology: Topology,
    pub synthetic: Option<SyntheticSource>,
    pub filter_complex: Option<String>,
    pub maps: Vec<String>,
}

impl Topology {
    /// Whether this topology reads the video manifest.
    pub fn uses_video_manifest(&self) -> bool {
        !matches!(self, Topology::AudioOnly)
    }

    /// Whether this topology reads the audio manifest.
    pub fn uses_audio_manifest(&self) -> bool {
        matches!(self, Topology::Both | Topology::AudioOnly)
    }

    pub fn graph(&self, geometry: &OutputGeometry) -> TranscodeGraph {
        let fit = scale_pad(geometry);
        match self {
            Topology::Both => TranscodeGraph {
                topology: *self,
                synthetic: None,
                filter_complex: Some(format!("[0:v]{}[vout];[1:a]volume=1.0[aout]", fit)),
                maps: vec!["[vout]".to_string(), "[aout]".to_string()],
            },
            Topology::VideoOnly => TranscodeGraph {
                topology: *self,
                synthetic: None,
                filter_complex: Some(format!("[0:v]{}[vout]", fit)),
                // Optional: clips without an audio track still stream
                maps: vec!["[vout]".to_string(), "0:a?".to_string()],
            },
            Topology::VideoWithStills => TranscodeGraph {
                topology: *self,
                synthetic: Some(SyntheticSource::Silence {
                    sample_rate: geometry.sample_rate,
                }),
                filter_complex: Some(format!(
                    "[0:v]{},fps={}[vout]",
                    fit, geometry.frame_rate
                )),
                maps: vec!["[vout]".to_string(), "1:a".to_string()],
            },
            Topology::AudioOnly => TranscodeGraph {
                topology: *self,
                synthetic: Some(SyntheticSource::Filler {
                    width: geometry.width,
                    height: geometry.height,
                    frame_rate: geometry.frame_rate,
                }),
                filter_complex: None,
                maps: vec!["1:v".to_string(), "0:a".to_string()],
            },
        }
    }
}

/// Letterboxes any source into the output canvas without distortion.
fn scale_pad(geometry: &OutputGeometry) -> String {
    let (w, h) = (geometry.width, geometry.height);
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1"
    )
}
