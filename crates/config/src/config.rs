//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// A value parsed but cannot be used
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Filesystem layout for stream assets and per-run transient files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Root holding one directory per stream (`<uploads_dir>/<stream_id>/{video,audio}`)
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,
    /// Directory for generated concat manifests, kept apart from uploads
    #[serde(default = "default_transient_dir")]
    pub transient_dir: PathBuf,
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_transient_dir() -> PathBuf {
    PathBuf::from("streams")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            uploads_dir: default_uploads_dir(),
            transient_dir: default_transient_dir(),
        }
    }
}

/// Output encoding parameters handed to every ffmpeg run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscoderConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Target video bitrate, also used as the `-maxrate` ceiling
    #[serde(default = "default_video_bitrate_kbps")]
    pub video_bitrate_kbps: u32,
    /// Rate-control buffer size (`-bufsize`)
    #[serde(default = "default_buffer_size_kbps")]
    pub buffer_size_kbps: u32,
    /// GOP length in frames
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,
    #[serde(default = "default_audio_bitrate_kbps")]
    pub audio_bitrate_kbps: u32,
    #[serde(default = "default_audio_sample_rate")]
    pub audio_sample_rate: u32,
    /// x264 preset
    #[serde(default = "default_preset")]
    pub preset: String,
    /// Display time of a still image within the video loop, in seconds
    #[serde(default = "default_image_duration_secs")]
    pub image_duration_secs: f64,
    /// Wrap the RTMP output in ffmpeg's fifo muxer so dropped connections are retried
    #[serde(default = "default_reconnect_on_drop")]
    pub reconnect_on_drop: bool,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_frame_rate() -> u32 {
    30
}

fn default_video_bitrate_kbps() -> u32 {
    2500
}

fn default_buffer_size_kbps() -> u32 {
    5000
}

fn default_keyframe_interval() -> u32 {
    60
}

fn default_audio_bitrate_kbps() -> u32 {
    128
}

fn default_audio_sample_rate() -> u32 {
    44100
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_image_duration_secs() -> f64 {
    5.0
}

fn default_reconnect_on_drop() -> bool {
    true
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            width: default_width(),
            height: default_height(),
            frame_rate: default_frame_rate(),
            video_bitrate_kbps: default_video_bitrate_kbps(),
            buffer_size_kbps: default_buffer_size_kbps(),
            keyframe_interval: default_keyframe_interval(),
            audio_bitrate_kbps: default_audio_bitrate_kbps(),
            audio_sample_rate: default_audio_sample_rate(),
            preset: default_preset(),
            image_duration_secs: default_image_duration_secs(),
            reconnect_on_drop: default_reconnect_on_drop(),
        }
    }
}

/// Timing policy for stop and restart
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Seconds between the graceful quit request and a forced kill
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Settle delay between the stop and the start of a restart
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
}

fn default_stop_grace_secs() -> u64 {
    5
}

fn default_restart_delay_secs() -> u64 {
    2
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: default_stop_grace_secs(),
            restart_delay_secs: default_restart_delay_secs(),
        }
    }
}

/// HTTP control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values ffmpeg would fail on at stream start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.transcoder;
        if !t.image_duration_secs.is_finite() || t.image_duration_secs <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "transcoder.image_duration_secs must be a positive number, got {}",
                t.image_duration_secs
            )));
        }
        for (name, value) in [
            ("width", t.width),
            ("height", t.height),
            ("frame_rate", t.frame_rate),
            ("audio_sample_rate", t.audio_sample_rate),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "transcoder.{} must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - LOOPCAST_UPLOADS_DIR -> storage.uploads_dir
    /// - LOOPCAST_TRANSIENT_DIR -> storage.transient_dir
    /// - LOOPCAST_FFMPEG_PATH -> transcoder.ffmpeg_path
    /// - LOOPCAST_BIND_ADDR -> server.bind_addr
    /// - LOOPCAST_STOP_GRACE_SECS -> supervisor.stop_grace_secs
    /// - LOOPCAST_RESTART_DELAY_SECS -> supervisor.restart_delay_secs
    /// - LOOPCAST_LOG_LEVEL -> logging.level
    pub fn apply_env_overrides(&mut self) {
        if let Some(val) = non_empty_var("LOOPCAST_UPLOADS_DIR") {
            self.storage.uploads_dir = PathBuf::from(val);
        }

        if let Some(val) = non_empty_var("LOOPCAST_TRANSIENT_DIR") {
            self.storage.transient_dir = PathBuf::from(val);
        }

        if let Some(val) = non_empty_var("LOOPCAST_FFMPEG_PATH") {
            self.transcoder.ffmpeg_path = PathBuf::from(val);
        }

        if let Some(val) = non_empty_var("LOOPCAST_BIND_ADDR") {
            self.server.bind_addr = val;
        }

        // Numeric overrides keep the existing value when unparsable
        if let Some(val) = non_empty_var("LOOPCAST_STOP_GRACE_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.supervisor.stop_grace_secs = secs;
            }
        }

        if let Some(val) = non_empty_var("LOOPCAST_RESTART_DELAY_SECS") {
            if let Ok(secs) = val.parse::<u64>() {
                self.supervisor.restart_delay_secs = secs;
            }
        }

        if let Some(val) = non_empty_var("LOOPCAST_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    /// (still subject to environment overrides).
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
