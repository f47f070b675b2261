//! Process supervisor.
//!
//! Owns the stream registry and drives every lifecycle transition: it starts
//! runs (manifests, topology, launch), stops them, applies worker events and
//! publishes the resulting status changes. It is single-threaded by
//! construction; the engine's control task is its only caller.

use crate::broadcast::{StatusBroadcaster, StreamEvent, StreamSummary};
use crate::catalog::{AssetCatalog, MediaClass};
use crate::config::Config;
use crate::error::{EngineError, PreconditionError};
use crate::manifest::{manifest_path, remove_manifests, Manifest};
use crate::registry::{ResumeTicket, RunEntry, StreamRegistry};
use crate::stream::{StreamId, StreamStatus};
use crate::topology::{plan, OutputGeometry};
use crate::transcode::ffmpeg::geometry_from_config;
use crate::transcode::{Destination, TranscodeInput, TranscodeRequest};
use crate::worker::{TranscoderLauncher, WorkerEvent, WorkerEventKind, WorkerEventSender};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Supervisor policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub transient_dir: PathBuf,
    pub stop_grace: Duration,
    pub geometry: OutputGeometry,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            transient_dir: config.storage.transient_dir.clone(),
            stop_grace: Duration::from_secs(config.supervisor.stop_grace_secs),
            geometry: geometry_from_config(&config.transcoder),
        }
    }
}

pub struct Supervisor {
    catalog: AssetCatalog,
    registry: StreamRegistry,
    launcher: Arc<dyn TranscoderLauncher>,
    broadcaster: StatusBroadcaster,
    events_tx: WorkerEventSender,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        catalog: AssetCatalog,
        launcher: Arc<dyn TranscoderLauncher>,
        broadcaster: StatusBroadcaster,
        events_tx: WorkerEventSender,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            catalog,
            registry: StreamRegistry::new(),
            launcher,
            broadcaster,
            events_tx,
            settings,
        }
    }

    pub fn catalog(&self) -> &AssetCatalog {
        &self.catalog
    }

    /// Creates storage for a new stream and records it as `Created`.
    pub fn register_stream(&mut self, raw_id: &str) -> Result<StreamId, EngineError> {
        let id = StreamId::parse(raw_id)?;
        self.catalog.create_stream(&id)?;
        self.registry.register(&id);
        info!(stream_id = %id, "stream registered");
        self.publish_status(&id, StreamStatus::Created, None);
        Ok(id)
    }

    /// Current status; streams that exist on disk but were never touched in
    /// this process report `Created`.
    pub fn status(&self, id: &StreamId) -> Result<StreamStatus, EngineError> {
        if let Some(status) = self.registry.status(id) {
            return Ok(status);
        }
        if self.catalog.stream_exists(id) {
            Ok(StreamStatus::Created)
        } else {
            Err(PreconditionError::UnknownStream(id.to_string()).into())
        }
    }

    pub fn is_running(&self, id: &StreamId) -> bool {
        self.registry.is_active(id)
    }

    /// Summaries of every stream on disk or in memory.
    pub fn snapshot(&self) -> Vec<StreamSummary> {
        let mut ids = self.catalog.list_stream_ids();
        ids.extend(self.registry.known_ids());
        ids.sort();
        ids.dedup();

        ids.into_iter()
            .map(|id| {
                let listing = self.catalog.list(&id);
                StreamSummary {
                    status: self.registry.status(&id).unwrap_or(StreamStatus::Created),
                    video_count: listing.video.len(),
                    audio_count: listing.audio.len(),
                    is_running: self.registry.is_active(&id),
                    stream_id: id,
                }
            })
            .collect()
    }

    /// Launches a run for `id`. Returns its generation.
    ///
    /// The status stays as it was until the worker reports `Started`.
    pub fn start(&mut self, id: &StreamId, destination: Destination) -> Result<u64, EngineError> {
        if self.registry.is_active(id) {
            return Err(PreconditionError::AlreadyRunning(id.to_string()).into());
        }

        let listing = self.catalog.list(id);
        let topology = plan(
            !listing.video.is_empty(),
            !listing.audio.is_empty(),
            listing.has_stills(),
        )
        .map_err(|_| PreconditionError::NoAssets(id.to_string()))?;

        let generation = self.registry.begin_run(id, topology)?;
        // A manual start supersedes a pending restart
        self.registry.clear_resume(id);

        let mut inputs = Vec::new();
        let mut written = Vec::new();
        for class in MediaClass::ALL {
            let manifest = Manifest::build(listing.class(class), class);
            if manifest.is_empty() {
                continue;
            }
            let path = manifest_path(&self.settings.transient_dir, id, class);
            if let Err(e) = manifest.write_to(&path) {
                remove_manifests(&written);
                self.fail_run(id, generation, format!("failed to write {} manifest: {}", class, e));
                return Err(e.into());
            }
            written.push(path.clone());
            inputs.push(TranscodeInput {
                class,
                manifest_path: path,
            });
        }
        self.registry.set_manifests(id, generation, written);

        let request = TranscodeRequest {
            stream_id: id.clone(),
            generation,
            inputs,
            graph: topology.graph(&self.settings.geometry),
            destination,
        };

        info!(
            stream_id = %id,
            generation,
            %topology,
            video = listing.video.len(),
            audio = listing.audio.len(),
            "starting stream"
        );

        match self.launcher.launch(request, self.events_tx.clone()) {
            Ok(handle) => {
                if let Err(orphan) = self.registry.attach_handle(id, generation, handle) {
                    orphan.shutdown(self.settings.stop_grace);
                }
                Ok(generation)
            }
            Err(e) => {
                self.fail_run(id, generation, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Stops the active run, if any. Returns whether one was running.
    pub fn stop(&mut self, id: &StreamId) -> bool {
        self.registry.clear_resume(id);

        let Some(run) = self.registry.take_run(id) else {
            debug!(stream_id = %id, "stop requested for idle stream");
            return false;
        };

        info!(
            stream_id = %id,
            generation = run.generation,
            topology = %run.topology,
            "stopping stream"
        );
        self.release(run);
        self.registry.set_status(id, StreamStatus::Stopped);
        self.publish_status(id, StreamStatus::Stopped, None);
        true
    }

    /// First half of a restart: stops the stream and reserves the resume.
    pub fn begin_restart(&mut self, id: &StreamId) -> Result<ResumeTicket, EngineError> {
        if !self.catalog.stream_exists(id) && self.registry.status(id).is_none() {
            return Err(PreconditionError::UnknownStream(id.to_string()).into());
        }
        self.stop(id);
        Ok(self.registry.schedule_resume(id))
    }

    /// Second half of a restart.
    ///
    /// Does nothing if the ticket was cancelled by a stop or superseded by a
    /// start, or if the stream has no media left.
    pub fn resume(&mut self, id: &StreamId, ticket: ResumeTicket, destination: Destination) {
        if !self.registry.take_resume(id, ticket) {
            debug!(stream_id = %id, "restart resume cancelled");
            return;
        }
        match self.start(id, destination) {
            Ok(generation) => info!(stream_id = %id, generation, "stream restarted"),
            Err(EngineError::Precondition(reason)) => {
                info!(stream_id = %id, %reason, "restart skipped");
            }
            // Launch failures are already applied as an error transition
            Err(e) => warn!(stream_id = %id, error = %e, "restart failed"),
        }
    }

    pub fn remove_asset(&mut self, id: &StreamId, name: &str) -> Result<bool, EngineError> {
        if !self.catalog.stream_exists(id) {
            return Err(PreconditionError::UnknownStream(id.to_string()).into());
        }
        let removed = self.catalog.remove_asset(id, name)?;
        if removed {
            info!(stream_id = %id, asset = name, "asset removed");
        }
        Ok(removed)
    }

    /// Applies a worker event. Events from stale generations are dropped.
    pub fn handle_event(&mut self, event: WorkerEvent) {
        let WorkerEvent {
            stream_id: id,
            generation,
            kind,
        } = event;

        match kind {
            WorkerEventKind::Started { command_line } => {
                if self.registry.mark_running(&id, generation) {
                    debug!(stream_id = %id, generation, command = %command_line, "transcoder running");
                    self.registry.set_status(&id, StreamStatus::Streaming);
                    self.publish_status(&id, StreamStatus::Streaming, None);
                } else {
                    debug!(stream_id = %id, generation, "ignoring start of stale run");
                }
            }
            WorkerEventKind::Progress(sample) => {
                if self.registry.is_current(&id, generation) {
                    self.broadcaster.publish(StreamEvent::Progress {
                        stream_id: id,
                        sample,
                    });
                }
            }
            WorkerEventKind::Failed { message } => {
                if self.registry.is_current(&id, generation) {
                    self.fail_run(&id, generation, message);
                } else {
                    debug!(stream_id = %id, generation, "ignoring failure of stale run");
                }
            }
            WorkerEventKind::Ended => {
                if let Some(run) = self.registry.take_run_if(&id, generation) {
                    info!(stream_id = %id, generation, "transcoder ended");
                    self.release(run);
                    self.registry.set_status(&id, StreamStatus::Stopped);
                    self.publish_status(&id, StreamStatus::Stopped, None);
                } else {
                    debug!(stream_id = %id, generation, "ignoring end of stale run");
                }
            }
        }
    }

    /// Stops every active run.
    pub fn stop_all(&mut self) {
        for id in self.registry.active_ids() {
            self.stop(&id);
        }
    }

    /// Error transition: entry removed, manifests deleted, status `error`.
    fn fail_run(&mut self, id: &StreamId, generation: u64, message: String) {
        let Some(run) = self.registry.take_run_if(id, generation) else {
            return;
        };
        error!(stream_id = %id, generation, %message, "stream failed");
        self.release(run);
        self.registry.set_status(id, StreamStatus::Error);
        self.publish_status(id, StreamStatus::Error, Some(message));
    }

    fn release(&self, run: RunEntry) {
        if let Some(handle) = run.handle {
            handle.shutdown(self.settings.stop_grace);
        }
        remove_manifests(&run.manifests);
    }

    fn publish_status(&self, id: &StreamId, status: StreamStatus, message: Option<String>) {
        self.broadcaster.publish(StreamEvent::status(id, status, message));
    }
}
