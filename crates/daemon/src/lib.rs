//! Loopcast stream daemon
//!
//! Keeps per-stream media folders, turns them into looping ffmpeg playlists,
//! and supervises one ffmpeg process per live stream pushing to an RTMP
//! destination. Control happens over an HTTP/WebSocket API.

pub mod broadcast;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod registry;
pub mod server;
pub mod startup;
pub mod stream;
pub mod supervisor;
pub mod topology;
pub mod transcode;
pub mod worker;

pub use broadcast::{StatusBroadcaster, StreamEvent, StreamSummary, Subscription, Topic};
pub use catalog::{Asset, AssetCatalog, AssetKind, AssetListing, MediaClass};
pub use engine::{Engine, EngineHandle};
pub use error::{EngineError, LaunchError, PreconditionError};
pub use loopcast_daemon_config as config;
pub use loopcast_daemon_config::Config;
pub use manifest::{Manifest, ManifestEntry};
pub use server::{create_router, run_server, ServerError};
pub use startup::{
    check_ffmpeg_available, check_required_encoders, ensure_directories, parse_ffmpeg_version,
    run_startup_checks, StartupError,
};
pub use stream::{StreamId, StreamStatus};
pub use topology::{plan, Topology};
pub use transcode::{build_ffmpeg_command, Destination, TranscodeSettings};
pub use worker::{FfmpegLauncher, TranscoderLauncher, WorkerEvent, WorkerEventKind, WorkerHandle};
