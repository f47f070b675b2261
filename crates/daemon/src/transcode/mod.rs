//! Transcoder invocation for loop streams.
//!
//! Builds the ffmpeg command line for a planned run and parses the
//! machine-readable progress it reports.

pub mod ffmpeg;
pub mod progress;

pub use ffmpeg::{build_ffmpeg_command, Destination, TranscodeInput, TranscodeRequest, TranscodeSettings};
pub use progress::{ProgressParser, ProgressSample};
