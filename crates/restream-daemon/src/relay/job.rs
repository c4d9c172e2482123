//! Stream job state machine.
//!
//! `preparing -> starting -> streaming -> {completed | error | stopped}`.
//! A job may also fail straight to `error` before streaming when its key is
//! missing or the relay cannot be spawned. Terminal states are final.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::launcher::{ProcessControl, ProcessLauncher, RelayProcess};
use super::watcher::CompletionWatcher;

/// Title used when the uploader did not provide one.
pub const DEFAULT_TITLE: &str = "Live Stream";

/// Failure cause recorded when a job has no destination key.
pub const MISSING_KEY_MESSAGE: &str = "Stream key is required";

/// Lifecycle status of a stream job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Preparing,
    Starting,
    Streaming,
    Completed,
    Stopped,
    Error,
}

impl StreamStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// No transition leaves a terminal status.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Error)
    }
}

impl fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of a job, as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub id: String,
    pub status: StreamStatus,
    pub title: String,
    /// Seconds since the Unix epoch at which the job was registered.
    pub created_at: f64,
    /// Seconds since the Unix epoch at which the relay was launched.
    pub start_time: Option<f64>,
    /// Seconds since launch, 0 if never launched.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug)]
struct JobState {
    status: StreamStatus,
    start_time: Option<SystemTime>,
    /// Monotonic twin of `start_time`, used for `duration`.
    started: Option<Instant>,
    process: Option<ProcessControl>,
    running: bool,
    exit_code: Option<i32>,
    error: Option<String>,
}

impl JobState {
    const fn new() -> Self {
        Self {
            status: StreamStatus::Preparing,
            start_time: None,
            started: None,
            process: None,
            running: false,
            exit_code: None,
            error: None,
        }
    }

    fn fail(&mut self, cause: String) {
        self.status = StreamStatus::Error;
        self.error = Some(cause);
    }
}

/// One relay of an uploaded file to an ingest channel.
pub struct StreamJob {
    id: String,
    source_path: PathBuf,
    destination_key: String,
    title: String,
    created_at: SystemTime,
    state: Mutex<JobState>,
}

impl fmt::Debug for StreamJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamJob")
            .field("id", &self.id)
            .field("source_path", &self.source_path)
            .field("destination_key", &"<redacted>")
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

impl StreamJob {
    /// Create a job in `preparing` with a fresh UUID.
    pub fn new(source_path: PathBuf, destination_key: String, title: Option<String>) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            source_path,
            destination_key,
            title,
        )
    }

    /// Create a job in `preparing` under a caller-chosen id.
    pub fn with_id(
        id: String,
        source_path: PathBuf,
        destination_key: String,
        title: Option<String>,
    ) -> Self {
        Self {
            id,
            source_path,
            destination_key,
            title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            created_at: SystemTime::now(),
            state: Mutex::new(JobState::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Launch the relay and hand it to a [`CompletionWatcher`].
    ///
    /// Only acts on a `preparing` job. Failures are recorded on the job, never
    /// returned.
    pub async fn start(self: &Arc<Self>, launcher: &ProcessLauncher) {
        {
            let mut state = self.state.lock().await;
            if state.status != StreamStatus::Preparing {
                warn!(stream_id = %self.id, status = %state.status, "Start ignored, job already started");
                return;
            }
            if self.destination_key.is_empty() {
                warn!(stream_id = %self.id, "Refusing to start stream without a key");
                state.fail(MISSING_KEY_MESSAGE.to_string());
                return;
            }
            state.status = StreamStatus::Starting;
        }

        info!(
            stream_id = %self.id,
            title = %self.title,
            source = %self.source_path.display(),
            "Starting stream"
        );

        match launcher.launch(&self.source_path, &self.destination_key) {
            Ok(RelayProcess { child, control }) => {
                let kill_switch = control.kill_switch();
                let pid = control.pid();
                {
                    let mut state = self.state.lock().await;
                    state.status = StreamStatus::Streaming;
                    state.start_time = Some(SystemTime::now());
                    state.started = Some(Instant::now());
                    state.process = Some(control);
                    state.running = true;
                }
                info!(stream_id = %self.id, ?pid, "Stream is live");
                CompletionWatcher::spawn(Arc::clone(self), child, kill_switch);
            }
            Err(e) => {
                error!(stream_id = %self.id, error = %e, "Error starting stream");
                self.state.lock().await.fail(e.to_string());
            }
        }
    }

    /// Terminate the relay if it is running.
    ///
    /// Moves the job to `stopped` without waiting for the process to exit and
    /// returns `true`. Returns `false` and leaves the status untouched when
    /// there is no running process.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state)
    }

    /// Like [`stop`](Self::stop), but only when the job is `streaming`.
    pub async fn stop_if_streaming(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status != StreamStatus::Streaming {
            return false;
        }
        self.stop_locked(&mut state)
    }

    fn stop_locked(&self, state: &mut JobState) -> bool {
        if state.status.is_terminal() || !state.running {
            return false;
        }
        let Some(control) = state.process.as_ref() else {
            return false;
        };
        control.terminate();
        state.status = StreamStatus::Stopped;
        info!(stream_id = %self.id, pid = ?control.pid(), "Stream stopped");
        true
    }

    /// Apply the relay's exit to the job. `failure` is `None` on a clean exit.
    ///
    /// Only a `streaming` job changes status here; an earlier terminal status
    /// (e.g. `stopped`) is kept.
    pub(crate) async fn record_exit(
        &self,
        exit_code: Option<i32>,
        failure: Option<String>,
    ) -> StreamStatus {
        let mut state = self.state.lock().await;
        state.running = false;
        state.exit_code = exit_code;
        if state.status == StreamStatus::Streaming {
            match failure {
                None => state.status = StreamStatus::Completed,
                Some(cause) => state.fail(cause),
            }
        } else {
            debug!(
                stream_id = %self.id,
                status = %state.status,
                ?exit_code,
                "Relay exited after terminal transition, status kept"
            );
        }
        state.status
    }

    pub async fn status(&self) -> StreamStatus {
        self.state.lock().await.status
    }

    /// Fresh snapshot; `duration` is recomputed on every call.
    pub async fn snapshot(&self) -> StatusSnapshot {
        let state = self.state.lock().await;
        StatusSnapshot {
            id: self.id.clone(),
            status: state.status,
            title: self.title.clone(),
            created_at: epoch_secs(self.created_at),
            start_time: state.start_time.map(epoch_secs),
            duration: state.started.map_or(0.0, |s| s.elapsed().as_secs_f64()),
            error: state.error.clone(),
            exit_code: state.exit_code,
        }
    }
}

fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}
