//! Engine control loop.
//!
//! The engine is a single task that owns the supervisor. Callers talk to it
//! through a cloneable [`EngineHandle`]; each request carries a oneshot reply
//! channel. Worker events arrive on a second channel. Because both are
//! consumed by the same task, every operation on a stream is applied in
//! order and no locking is needed around the stream table.

use crate::broadcast::{StatusBroadcaster, StreamSummary, Subscription, Topic};
use crate::catalog::AssetCatalog;
use crate::config::Config;
use crate::error::EngineError;
use crate::registry::ResumeTicket;
use crate::stream::{StreamId, StreamStatus};
use crate::supervisor::{Supervisor, SupervisorSettings};
use crate::transcode::Destination;
use crate::worker::{TranscoderLauncher, WorkerEventReceiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Pending control requests before callers start waiting.
const CONTROL_CHANNEL_CAPACITY: usize = 64;

/// Extra time past the stop grace for transcoders to finish exiting.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum ControlRequest {
    Register {
        id: String,
        reply: Reply<StreamId>,
    },
    Start {
        id: StreamId,
        destination: Destination,
        reply: Reply<()>,
    },
    Stop {
        id: StreamId,
        reply: Reply<bool>,
    },
    Restart {
        id: StreamId,
        destination: Destination,
        reply: Reply<()>,
    },
    /// Second half of a restart, sent by the engine to itself.
    Resume {
        id: StreamId,
        ticket: ResumeTicket,
        destination: Destination,
    },
    Status {
        id: StreamId,
        reply: Reply<StreamStatus>,
    },
    List {
        reply: oneshot::Sender<Vec<StreamSummary>>,
    },
    RemoveAsset {
        id: StreamId,
        name: String,
        reply: Reply<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct Engine {
    supervisor: Supervisor,
    control_rx: mpsc::Receiver<ControlRequest>,
    /// Used to schedule resumes without keeping the engine alive.
    control_tx: mpsc::WeakSender<ControlRequest>,
    events_rx: WorkerEventReceiver,
    restart_delay: Duration,
    stop_grace: Duration,
}

impl Engine {
    pub fn new(config: &Config, launcher: Arc<dyn TranscoderLauncher>) -> (Engine, EngineHandle) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let broadcaster = StatusBroadcaster::new();

        let catalog = AssetCatalog::new(
            config.storage.uploads_dir.clone(),
            config.transcoder.image_duration_secs,
        );
        let supervisor = Supervisor::new(
            catalog,
            launcher,
            broadcaster.clone(),
            events_tx,
            SupervisorSettings::from_config(config),
        );

        let engine = Engine {
            supervisor,
            control_rx,
            control_tx: control_tx.downgrade(),
            events_rx,
            restart_delay: Duration::from_secs(config.supervisor.restart_delay_secs),
            stop_grace: Duration::from_secs(config.supervisor.stop_grace_secs),
        };
        let handle = EngineHandle {
            tx: control_tx,
            broadcaster,
        };
        (engine, handle)
    }

    /// Runs until shutdown is requested or every handle is dropped. Either
    /// way, all running streams are stopped on exit.
    pub async fn run(mut self) {
        info!("stream engine running");
        loop {
            tokio::select! {
                request = self.control_rx.recv() => match request {
                    Some(ControlRequest::Shutdown { reply }) => {
                        self.supervisor.stop_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_request(request),
                    None => {
                        self.supervisor.stop_all();
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.supervisor.handle_event(event),
            }
        }

        // Each worker holds an event sender until its process is gone
        let Engine {
            supervisor,
            mut events_rx,
            stop_grace,
            ..
        } = self;
        drop(supervisor);
        let drained = tokio::time::timeout(stop_grace + SHUTDOWN_SLACK, async {
            while events_rx.recv().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("transcoders still exiting at shutdown");
        }
        info!("stream engine stopped");
    }

    fn handle_request(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::Register { id, reply } => {
                let _ = reply.send(self.supervisor.register_stream(&id));
            }
            ControlRequest::Start {
                id,
                destination,
                reply,
            } => {
                let result = self.supervisor.start(&id, destination).map(|_| ());
                let _ = reply.send(result);
            }
            ControlRequest::Stop { id, reply } => {
                let _ = reply.send(Ok(self.supervisor.stop(&id)));
            }
            ControlRequest::Restart {
                id,
                destination,
                reply,
            } => {
                let result = self
                    .supervisor
                    .begin_restart(&id)
                    .map(|ticket| self.schedule_resume(id, ticket, destination));
                let _ = reply.send(result);
            }
            ControlRequest::Resume {
                id,
                ticket,
                destination,
            } => self.supervisor.resume(&id, ticket, destination),
            ControlRequest::Status { id, reply } => {
                let _ = reply.send(self.supervisor.status(&id));
            }
            ControlRequest::List { reply } => {
                let _ = reply.send(self.supervisor.snapshot());
            }
            ControlRequest::RemoveAsset { id, name, reply } => {
                let _ = reply.send(self.supervisor.remove_asset(&id, &name));
            }
            // Handled by the loop
            ControlRequest::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn schedule_resume(&self, id: StreamId, ticket: ResumeTicket, destination: Destination) {
        let Some(tx) = self.control_tx.upgrade() else {
            return;
        };
        let delay = self.restart_delay;
        debug!(stream_id = %id, delay_secs = delay.as_secs(), "restart resume scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx
                .send(ControlRequest::Resume {
                    id,
                    ticket,
                    destination,
                })
                .await;
        });
    }
}

/// Cloneable client for a running [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<ControlRequest>,
    broadcaster: StatusBroadcaster,
}

impl std::fmt::Debug for ControlRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlRequest::Register { .. } => "Register",
            ControlRequest::Start { .. } => "Start",
            ControlRequest::Stop { .. } => "Stop",
            ControlRequest::Restart { .. } => "Restart",
            ControlRequest::Resume { .. } => "Resume",
            ControlRequest::Status { .. } => "Status",
            ControlRequest::List { .. } => "List",
            ControlRequest::RemoveAsset { .. } => "RemoveAsset",
            ControlRequest::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlRequest,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    pub async fn register_stream(&self, id: &str) -> Result<StreamId, EngineError> {
        let id = id.to_string();
        self.call(|reply| ControlRequest::Register { id, reply }).await?
    }

    pub async fn start(&self, id: &StreamId, destination: Destination) -> Result<(), EngineError> {
        let id = id.clone();
        self.call(|reply| ControlRequest::Start {
            id,
            destination,
            reply,
        })
        .await?
    }

    /// Returns whether a run was stopped.
    pub async fn stop(&self, id: &StreamId) -> Result<bool, EngineError> {
        let id = id.clone();
        self.call(|reply| ControlRequest::Stop { id, reply }).await?
    }

    /// Stops the stream now and starts it again after the restart delay.
    pub async fn restart(&self, id: &StreamId, destination: Destination) -> Result<(), EngineError> {
        let id = id.clone();
        self.call(|reply| ControlRequest::Restart {
            id,
            destination,
            reply,
        })
        .await?
    }

    pub async fn status(&self, id: &StreamId) -> Result<StreamStatus, EngineError> {
        let id = id.clone();
        self.call(|reply| ControlRequest::Status { id, reply }).await?
    }

    pub async fn list_streams(&self) -> Result<Vec<StreamSummary>, EngineError> {
        self.call(|reply| ControlRequest::List { reply }).await
    }

    pub async fn remove_asset(&self, id: &StreamId, name: &str) -> Result<bool, EngineError> {
        let id = id.clone();
        let name = name.to_string();
        self.call(|reply| ControlRequest::RemoveAsset { id, name, reply })
            .await?
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        self.broadcaster.subscribe(topic)
    }

    /// Stops every stream and ends the control loop.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.call(|reply| ControlRequest::Shutdown { reply }).await
    }
}
