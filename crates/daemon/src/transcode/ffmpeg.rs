//! ffmpeg command construction.
//!
//! One ffmpeg process per running stream: every manifest is read through the
//! concat demuxer at native rate and looped forever, the planned filter graph
//! normalizes the tracks, and the result is encoded to H.264/AAC in FLV and
//! pushed to the RTMP destination.

use crate::catalog::MediaClass;
use crate::config::TranscoderConfig;
use crate::error::PreconditionError;
use crate::stream::StreamId;
use crate::topology::{OutputGeometry, TranscodeGraph};
use std::fmt;
use std::path::PathBuf;
use std::process::Command;

/// Encoder parameters shared by every run.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeSettings {
    pub ffmpeg_path: PathBuf,
    pub preset: String,
    pub video_bitrate_kbps: u32,
    pub buffer_size_kbps: u32,
    pub keyframe_interval: u32,
    pub audio_bitrate_kbps: u32,
    pub audio_sample_rate: u32,
    pub reconnect_on_drop: bool,
}

impl TranscodeSettings {
    pub fn from_config(config: &TranscoderConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            preset: config.preset.clone(),
            video_bitrate_kbps: config.video_bitrate_kbps,
            buffer_size_kbps: config.buffer_size_kbps,
            keyframe_interval: config.keyframe_interval,
            audio_bitrate_kbps: config.audio_bitrate_kbps,
            audio_sample_rate: config.audio_sample_rate,
            reconnect_on_drop: config.reconnect_on_drop,
        }
    }
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self::from_config(&TranscoderConfig::default())
    }
}

/// Canvas geometry configured for all streams.
pub fn geometry_from_config(config: &TranscoderConfig) -> OutputGeometry {
    OutputGeometry {
        width: config.width,
        height: config.height,
        frame_rate: config.frame_rate,
        sample_rate: config.audio_sample_rate,
    }
}

/// RTMP ingest endpoint plus stream key.
#[derive(Clone, PartialEq, Eq)]
pub struct Destination {
    base_url: String,
    credential: String,
}

impl Destination {
    /// Both parts are required; surrounding whitespace is ignored.
    pub fn new(base_url: &str, credential: &str) -> Result<Self, PreconditionError> {
        let base_url = base_url.trim();
        let credential = credential.trim();
        if base_url.is_empty() || credential.is_empty() {
            return Err(PreconditionError::MissingDestination);
        }
        Ok(Self {
            base_url: base_url.to_string(),
            credential: credential.to_string(),
        })
    }

    /// Full push URL: `<base_url>/<credential>`, without a doubled slash.
    pub fn url(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.credential)
    }
}

// The stream key is a secret; keep it out of logs.
impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("base_url", &self.base_url)
            .field("credential", &"<redacted>")
            .finish()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/<redacted>", self.base_url.trim_end_matches('/'))
    }
}

/// A manifest handed to ffmpeg as a looping concat input.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeInput {
    pub class: MediaClass,
    pub manifest_path: PathBuf,
}

/// Everything needed to launch one run.
#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    pub stream_id: StreamId,
    /// Run generation the worker's events are tagged with.
    pub generation: u64,
    /// Manifest inputs in index order (video before audio).
    pub inputs: Vec<TranscodeInput>,
    pub graph: TranscodeGraph,
    pub destination: Destination,
}

/// Build the ffmpeg command for a run.
///
/// The command writes progress records to stdout (`-progress pipe:1`), keeps
/// stderr for errors only, and reads stdin so a graceful stop can send `q`.
pub fn build_ffmpeg_command(request: &TranscodeRequest, settings: &TranscodeSettings) -> Command {
    let mut cmd = Command::new(&settings.ffmpeg_path);
    cmd.args(["-hide_banner", "-nostats", "-loglevel", "error"]);
    cmd.args(["-progress", "pipe:1"]);

    for input in &request.inputs {
        cmd.args(["-re", "-stream_loop", "-1", "-f", "concat", "-safe", "0"]);
        cmd.arg("-i").arg(&input.manifest_path);
    }

    if let Some(synthetic) = &request.graph.synthetic {
        cmd.args(["-f", "lavfi"]);
        cmd.arg("-i").arg(synthetic.lavfi_expr());
    }

    if let Some(filter) = &request.graph.filter_complex {
        cmd.arg("-filter_complex").arg(filter);
    }
    for map in &request.graph.maps {
        cmd.arg("-map").arg(map);
    }

    let video_bitrate = format!("{}k", settings.video_bitrate_kbps);
    let keyint = settings.keyframe_interval.to_string();
    cmd.args(["-c:v", "libx264"]);
    cmd.arg("-preset").arg(&settings.preset);
    cmd.args(["-tune", "zerolatency"]);
    cmd.arg("-b:v").arg(&video_bitrate);
    cmd.arg("-maxrate").arg(&video_bitrate);
    cmd.arg("-bufsize").arg(format!("{}k", settings.buffer_size_kbps));
    cmd.args(["-pix_fmt", "yuv420p"]);
    cmd.arg("-g").arg(&keyint);
    cmd.arg("-keyint_min").arg(&keyint);
    cmd.args(["-sc_threshold", "0"]);

    cmd.args(["-c:a", "aac"]);
    cmd.arg("-b:a").arg(format!("{}k", settings.audio_bitrate_kbps));
    cmd.arg("-ar").arg(settings.audio_sample_rate.to_string());
    cmd.args(["-ac", "2"]);

    if settings.reconnect_on_drop {
        // fifo keeps encoding while the RTMP connection is re-established
        cmd.args(["-f", "fifo", "-fifo_format", "flv"]);
        cmd.args(["-attempt_recovery", "1", "-recover_any_error", "1"]);
        cmd.args(["-recovery_wait_time", "2", "-drop_pkts_on_overflow", "1"]);
    } else {
        cmd.args(["-f", "flv"]);
    }
    cmd.arg(request.destination.url());

    cmd
}

/// Renders a command line for logs with the destination key masked.
pub fn describe_command(cmd: &Command, destination: &Destination) -> String {
    let secret = destination.url();
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    for arg in cmd.get_args() {
        let arg = arg.to_string_lossy();
        if arg == secret {
            parts.push(destination.to_string());
        } else {
            parts.push(arg.into_owned());
        }
    }
    parts.join(" ")
}
