//! Parser for ffmpeg's `-progress` output.
//!
//! ffmpeg emits blocks of `key=value` lines, each block terminated by a
//! `progress=continue` (or `progress=end`) line.

use serde::Serialize;

/// One progress block.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSample {
    pub frame: u64,
    pub fps: f64,
    /// `None` while ffmpeg reports `N/A`.
    pub bitrate_kbps: Option<f64>,
    pub total_size_bytes: u64,
    /// Position in the output, `HH:MM:SS.micros`.
    pub out_time: String,
    /// Encoding speed relative to real time.
    pub speed: Option<f64>,
}

/// Accumulates lines into [`ProgressSample`]s.
#[derive(Debug, Default)]
pub struct ProgressParser {
    current: ProgressSample,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line; returns a sample when the line closes a block.
    pub fn push_line(&mut self, line: &str) -> Option<ProgressSample> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key.trim() {
            "frame" => self.current.frame = value.parse().unwrap_or(self.current.frame),
            "fps" => self.current.fps = value.parse().unwrap_or(self.current.fps),
            "bitrate" => {
                self.current.bitrate_kbps = value.trim_end_matches("kbits/s").trim().parse().ok()
            }
            "total_size" => {
                self.current.total_size_bytes =
                    value.parse().unwrap_or(self.current.total_size_bytes)
            }
            "out_time" => self.current.out_time = value.to_string(),
            "speed" => self.current.speed = value.trim_end_matches('x').trim().parse().ok(),
            "progress" => return Some(std::mem::take(&mut self.current)),
            _ => {}
        }
        None
    }
}
