//! Error types surfaced by the orchestration engine.

use thiserror::Error;

/// Synchronous rejections: nothing was launched and no state was touched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreconditionError {
    #[error("invalid stream id '{0}': only letters, digits, '_' and '-' are allowed")]
    InvalidStreamId(String),

    #[error("stream '{0}' already exists")]
    StreamExists(String),

    #[error("stream '{0}' not found")]
    UnknownStream(String),

    #[error("stream '{0}' is already running")]
    AlreadyRunning(String),

    #[error("no media files found for stream '{0}'")]
    NoAssets(String),

    #[error("RTMP URL and stream key are required")]
    MissingDestination,

    #[error("invalid asset name '{0}'")]
    InvalidAssetName(String),
}

/// The transcoder process could not be brought up.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transcoder pipe unavailable: {0}")]
    MissingPipe(&'static str),
}

/// Error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("launch failed: {0}")]
    Launch(#[from] LaunchError),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    /// The control loop has exited; no further requests are accepted.
    #[error("stream engine is not running")]
    EngineStopped,
}
