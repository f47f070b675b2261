//! In-memory stream state.
//!
//! Tracks the last known status of every stream and the single active run
//! (if any) per stream. A run is identified by a generation number that
//! increases across the whole registry, so a worker event can always be
//! matched against the run that is currently active.

use crate::error::PreconditionError;
use crate::stream::{StreamId, StreamStatus};
use crate::topology::Topology;
use crate::worker::WorkerHandle;
use std::collections::HashMap;
use std::path::PathBuf;

/// Lifecycle of an active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Launched, waiting for the transcoder to report in.
    Starting,
    Running,
}

/// The active transcoder run of a stream.
pub struct RunEntry {
    pub generation: u64,
    pub state: RunState,
    pub topology: Topology,
    pub handle: Option<Box<dyn WorkerHandle>>,
    /// Manifests written for this run, removed when it ends.
    pub manifests: Vec<PathBuf>,
}

impl std::fmt::Debug for RunEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEntry")
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("topology", &self.topology)
            .field("pid", &self.handle.as_ref().and_then(|h| h.pid()))
            .field("manifests", &self.manifests)
            .finish()
    }
}

/// Reservation for the second half of a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeTicket(u64);

#[derive(Debug, Default)]
pub struct StreamRegistry {
    statuses: HashMap<StreamId, StreamStatus>,
    runs: HashMap<StreamId, RunEntry>,
    resumes: HashMap<StreamId, ResumeTicket>,
    next_generation: u64,
    next_ticket: u64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a stream as `Created` unless it is already known.
    pub fn register(&mut self, id: &StreamId) {
        self.statuses.entry(id.clone()).or_insert(StreamStatus::Created);
    }

    pub fn status(&self, id: &StreamId) -> Option<StreamStatus> {
        self.statuses.get(id).copied()
    }

    pub fn set_status(&mut self, id: &StreamId, status: StreamStatus) {
        self.statuses.insert(id.clone(), status);
    }

    /// Whether a run is starting or running.
    pub fn is_active(&self, id: &StreamId) -> bool {
        self.runs.contains_key(id)
    }

    pub fn run(&self, id: &StreamId) -> Option<&RunEntry> {
        self.runs.get(id)
    }

    /// Reserves the run slot for `id` and returns the new generation.
    ///
    /// Check and insert happen together, so of two concurrent starts exactly
    /// one wins.
    pub fn begin_run(&mut self, id: &StreamId, topology: Topology) -> Result<u64, PreconditionError> {
        if self.runs.contains_key(id) {
            return Err(PreconditionError::AlreadyRunning(id.to_string()));
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.runs.insert(
            id.clone(),
            RunEntry {
                generation,
                state: RunState::Starting,
                topology,
                handle: None,
                manifests: Vec::new(),
            },
        );
        Ok(generation)
    }

    pub fn set_manifests(&mut self, id: &StreamId, generation: u64, manifests: Vec<PathBuf>) {
        if let Some(run) = self.current_mut(id, generation) {
            run.manifests = manifests;
        }
    }

    /// Stores the worker handle; hands it back if the run is gone.
    pub fn attach_handle(
        &mut self,
        id: &StreamId,
        generation: u64,
        handle: Box<dyn WorkerHandle>,
    ) -> Result<(), Box<dyn WorkerHandle>> {
        match self.current_mut(id, generation) {
            Some(run) => {
                run.handle = Some(handle);
                Ok(())
            }
            None => Err(handle),
        }
    }

    /// Moves a starting run to running. Returns false for stale generations.
    pub fn mark_running(&mut self, id: &StreamId, generation: u64) -> bool {
        match self.current_mut(id, generation) {
            Some(run) => {
                run.state = RunState::Running;
                true
            }
            None => false,
        }
    }

    pub fn is_current(&self, id: &StreamId, generation: u64) -> bool {
        self.runs
            .get(id)
            .map(|run| run.generation == generation)
            .unwrap_or(false)
    }

    /// Removes whatever run `id` has.
    pub fn take_run(&mut self, id: &StreamId) -> Option<RunEntry> {
        self.runs.remove(id)
    }

    /// Removes the run only if it is still generation `generation`.
    pub fn take_run_if(&mut self, id: &StreamId, generation: u64) -> Option<RunEntry> {
        if self.is_current(id, generation) {
            self.runs.remove(id)
        } else {
            None
        }
    }

    pub fn active_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.runs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every stream with a recorded status or an active run, sorted.
    pub fn known_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .statuses
            .keys()
            .chain(self.runs.keys())
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Issues a resume ticket, replacing any earlier one for `id`.
    pub fn schedule_resume(&mut self, id: &StreamId) -> ResumeTicket {
        self.next_ticket += 1;
        let ticket = ResumeTicket(self.next_ticket);
        self.resumes.insert(id.clone(), ticket);
        ticket
    }

    /// Redeems `ticket`. Fails if it was cancelled or superseded.
    pub fn take_resume(&mut self, id: &StreamId, ticket: ResumeTicket) -> bool {
        if self.resumes.get(id) == Some(&ticket) {
            self.resumes.remove(id);
            true
        } else {
            false
        }
    }

    pub fn clear_resume(&mut self, id: &StreamId) {
        self.resumes.remove(id);
    }

    fn current_mut(&mut self, id: &StreamId, generation: u64) -> Option<&mut RunEntry> {
        self.runs
            .get_mut(id)
            .filter(|run| run.generation == generation)
    }
}
