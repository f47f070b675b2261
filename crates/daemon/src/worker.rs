//! Transcoder workers.
//!
//! A worker is one external ffmpeg process plus the tasks that watch it. The
//! supervisor never talks to the process directly: it launches through a
//! [`TranscoderLauncher`], keeps the returned [`WorkerHandle`] to stop it, and
//! learns about everything else from [`WorkerEvent`]s delivered on a channel.
//! Every event carries the run generation it belongs to so that events from a
//! superseded run can be recognized and dropped.

use crate::error::LaunchError;
use crate::stream::StreamId;
use crate::transcode::ffmpeg::describe_command;
use crate::transcode::{build_ffmpeg_command, ProgressParser, ProgressSample, TranscodeRequest, TranscodeSettings};
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Number of stderr lines kept for failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for the output readers to drain after the process exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Something a worker observed.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEventKind {
    /// The process is up.
    Started { command_line: String },
    Progress(ProgressSample),
    /// The process exited abnormally.
    Failed { message: String },
    /// The process exited cleanly on its own.
    Ended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEvent {
    pub stream_id: StreamId,
    pub generation: u64,
    pub kind: WorkerEventKind,
}

pub type WorkerEventSender = mpsc::UnboundedSender<WorkerEvent>;
pub type WorkerEventReceiver = mpsc::UnboundedReceiver<WorkerEvent>;

/// Control side of a running worker.
pub trait WorkerHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Asks the process to quit, force-killing it once `grace` elapses.
    ///
    /// Returns immediately; no event is emitted for a requested stop.
    fn shutdown(self: Box<Self>, grace: Duration);
}

/// Starts transcoder processes.
pub trait TranscoderLauncher: Send + Sync {
    fn launch(
        &self,
        request: TranscodeRequest,
        events: WorkerEventSender,
    ) -> Result<Box<dyn WorkerHandle>, LaunchError>;
}

/// Launches real ffmpeg processes.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    settings: TranscodeSettings,
}

impl FfmpegLauncher {
    pub fn new(settings: TranscodeSettings) -> Self {
        Self { settings }
    }
}

impl TranscoderLauncher for FfmpegLauncher {
    fn launch(
        &self,
        request: TranscodeRequest,
        events: WorkerEventSender,
    ) -> Result<Box<dyn WorkerHandle>, LaunchError> {
        let std_cmd = build_ffmpeg_command(&request, &self.settings);
        let command_line = describe_command(&std_cmd, &request.destination);

        let mut cmd = tokio::process::Command::from(std_cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.settings.ffmpeg_path.display().to_string(),
            source,
        })?;

        // A missing pipe drops `child` here, which kills it
        let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;
        let pid = child.id();

        info!(
            stream_id = %request.stream_id,
            generation = request.generation,
            pid,
            command = %command_line,
            "transcoder started"
        );

        let ctx = EventContext {
            stream_id: request.stream_id.clone(),
            generation: request.generation,
            events,
        };
        ctx.send(WorkerEventKind::Started { command_line });

        let progress_task = tokio::spawn(read_progress(stdout, ctx.clone()));
        let stderr_task = tokio::spawn(read_stderr_tail(stderr, ctx.stream_id.clone()));

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(supervise_child(
            child,
            stdin,
            shutdown_rx,
            progress_task,
            stderr_task,
            ctx,
        ));

        Ok(Box::new(FfmpegWorker {
            pid,
            shutdown_tx: Some(shutdown_tx),
        }))
    }
}

/// Handle to a running ffmpeg worker.
///
/// Dropping it without calling [`WorkerHandle::shutdown`] kills the process.
#[derive(Debug)]
struct FfmpegWorker {
    pid: Option<u32>,
    shutdown_tx: Option<oneshot::Sender<Duration>>,
}

impl WorkerHandle for FfmpegWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn shutdown(mut self: Box<Self>, grace: Duration) {
        if let Some(tx) = self.shutdown_tx.take() {
            // Err means the process already exited
            let _ = tx.send(grace);
        }
    }
}

#[derive(Debug, Clone)]
struct EventContext {
    stream_id: StreamId,
    generation: u64,
    events: WorkerEventSender,
}

impl EventContext {
    fn send(&self, kind: WorkerEventKind) {
        let event = WorkerEvent {
            stream_id: self.stream_id.clone(),
            generation: self.generation,
            kind,
        };
        if self.events.send(event).is_err() {
            debug!(stream_id = %self.stream_id, "event receiver gone");
        }
    }
}

/// Next line from a child pipe, decoded lossily. `None` at EOF or on a read
/// error.
///
/// ffmpeg echoes file names and metadata verbatim, so its output is not
/// guaranteed to be UTF-8. Decoding must never stop the drain: a pipe left
/// unread can block or SIGPIPE the child.
async fn next_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(String::from_utf8_lossy(buf).trim_end().to_string()),
    }
}

async fn read_progress(stdout: ChildStdout, ctx: EventContext) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut parser = ProgressParser::new();
    while let Some(line) = next_lossy_line(&mut reader, &mut buf).await {
        if let Some(sample) = parser.push_line(&line) {
            ctx.send(WorkerEventKind::Progress(sample));
        }
    }
}

async fn read_stderr_tail(stderr: ChildStderr, stream_id: StreamId) -> VecDeque<String> {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Some(line) = next_lossy_line(&mut reader, &mut buf).await {
        if line.is_empty() {
            continue;
        }
        debug!(stream_id = %stream_id, "ffmpeg: {}", line);
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    StopRequested(Duration),
    HandleDropped,
}

async fn supervise_child(
    mut child: Child,
    stdin: ChildStdin,
    shutdown_rx: oneshot::Receiver<Duration>,
    progress_task: JoinHandle<()>,
    stderr_task: JoinHandle<VecDeque<String>>,
    ctx: EventContext,
) {
    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        request = shutdown_rx => match request {
            Ok(grace) => Outcome::StopRequested(grace),
            Err(_) => Outcome::HandleDropped,
        },
    };

    match outcome {
        Outcome::StopRequested(grace) => {
            stop_gracefully(&mut child, stdin, grace, &ctx).await;
            info!(stream_id = %ctx.stream_id, generation = ctx.generation, "transcoder stopped");
        }
        Outcome::HandleDropped => {
            warn!(stream_id = %ctx.stream_id, "worker handle dropped, killing transcoder");
            drop(stdin);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Outcome::Exited(status) => {
            drop(stdin);
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, progress_task).await;
            let tail = match tokio::time::timeout(DRAIN_TIMEOUT, stderr_task).await {
                Ok(Ok(tail)) => tail,
                _ => VecDeque::new(),
            };
            ctx.send(exit_event(status, &tail));
        }
    }
}

/// Sends `q` on stdin, then escalates to a kill after `grace`.
async fn stop_gracefully(child: &mut Child, mut stdin: ChildStdin, grace: Duration, ctx: &EventContext) {
    if let Err(e) = stdin.write_all(b"q").await {
        debug!(stream_id = %ctx.stream_id, error = %e, "could not send quit to transcoder");
    }
    let _ = stdin.flush().await;
    drop(stdin);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(
                stream_id = %ctx.stream_id,
                grace_secs = grace.as_secs_f64(),
                "transcoder ignored quit, killing"
            );
            if let Err(e) = child.start_kill() {
                warn!(stream_id = %ctx.stream_id, error = %e, "kill failed");
            }
            let _ = child.wait().await;
        }
    }
}

fn exit_event(status: std::io::Result<ExitStatus>, stderr_tail: &VecDeque<String>) -> WorkerEventKind {
    match status {
        Ok(status) if status.success() => WorkerEventKind::Ended,
        Ok(status) => {
            let mut message = format!("ffmpeg exited with {}", status);
            if !stderr_tail.is_empty() {
                message.push_str(": ");
                message.push_str(&stderr_tail.iter().cloned().collect::<Vec<_>>().join("\n"));
            }
            WorkerEventKind::Failed { message }
        }
        Err(e) => WorkerEventKind::Failed {
            message: format!("failed to wait for ffmpeg: {}", e),
        },
    }
}
