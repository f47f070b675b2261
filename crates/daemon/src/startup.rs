//! Startup checks for the stream daemon
//!
//! Preflight verification run before the engine accepts requests:
//! - the configured ffmpeg binary runs and reports a version
//! - that ffmpeg build ships the encoders every stream needs
//! - the uploads and transient directories exist

use crate::config::Config;
use std::fs;
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::info;

/// Encoders the output pipeline is built on.
pub const REQUIRED_ENCODERS: &[&str] = &["libx264", "aac"];

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("ffmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("ffmpeg build lacks required encoder '{0}'")]
    MissingEncoder(String),

    #[error("cannot prepare directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
///
/// Git snapshots ("ffmpeg version N-112233-g...") carry no release number and
/// yield `None`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let major_str = version_part
        .trim_start_matches('n')
        .split(['.', '-'])
        .next()?;

    major_str.parse().ok()
}

/// Whether `ffmpeg -encoders` output lists `encoder`.
///
/// Encoder lines look like ` V....D libx264   libx264 H.264 ...`: a flags
/// column followed by the encoder name.
pub fn encoder_listed(encoders_output: &str, encoder: &str) -> bool {
    encoders_output.lines().any(|line| {
        let mut columns = line.split_whitespace();
        matches!(
            (columns.next(), columns.next()),
            (Some(flags), Some(name)) if flags.len() == 6 && name == encoder
        )
    })
}

fn run_ffmpeg(ffmpeg: &Path, args: &[&str]) -> Result<String, StartupError> {
    let output = Command::new(ffmpeg).args(args).output().map_err(|e| {
        StartupError::FfmpegUnavailable(format!(
            "failed to run {} {}: {}",
            ffmpeg.display(),
            args.join(" "),
            e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} {} exited with {}",
            ffmpeg.display(),
            args.join(" "),
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs `ffmpeg -version`; returns the major version when it can be parsed.
pub fn check_ffmpeg_available(ffmpeg: &Path) -> Result<Option<u32>, StartupError> {
    let output = run_ffmpeg(ffmpeg, &["-version"])?;
    let major = parse_ffmpeg_version(&output);
    info!(
        ffmpeg = %ffmpeg.display(),
        major = ?major,
        version = output.lines().next().unwrap_or("(empty)"),
        "ffmpeg found"
    );
    Ok(major)
}

/// Verifies every encoder in [`REQUIRED_ENCODERS`] is compiled in.
pub fn check_required_encoders(ffmpeg: &Path) -> Result<(), StartupError> {
    let output = run_ffmpeg(ffmpeg, &["-hide_banner", "-encoders"])?;
    for encoder in REQUIRED_ENCODERS {
        if !encoder_listed(&output, encoder) {
            return Err(StartupError::MissingEncoder(encoder.to_string()));
        }
    }
    Ok(())
}

/// Creates the uploads and transient directories if missing.
pub fn ensure_directories(cfg: &Config) -> Result<(), StartupError> {
    for dir in [&cfg.storage.uploads_dir, &cfg.storage.transient_dir] {
        fs::create_dir_all(dir).map_err(|source| StartupError::Directory {
            path: dir.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Run all startup checks in order
///
/// 1. ffmpeg availability
/// 2. Required encoders
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let ffmpeg = &cfg.transcoder.ffmpeg_path;
    check_ffmpeg_available(ffmpeg)?;
    check_required_encoders(ffmpeg)?;
    Ok(())
}
