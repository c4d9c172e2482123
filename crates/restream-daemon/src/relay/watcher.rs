//! Per-relay completion watcher.
//!
//! Owns the relay `Child`, drains its output, waits for exit and applies the
//! terminal transition to the job.

use std::collections::VecDeque;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::StreamJob;

/// Number of trailing stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// How long a stopped relay may take to exit after SIGTERM.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// How long to wait for the output pipes to close after the relay exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Background task bound to one launched relay.
pub struct CompletionWatcher;

impl CompletionWatcher {
    /// Spawn the watcher task. The request path never awaits the handle.
    pub fn spawn(job: Arc<StreamJob>, child: Child, kill_switch: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(Self::watch(job, child, kill_switch))
    }

    async fn watch(job: Arc<StreamJob>, mut child: Child, kill_switch: Arc<Notify>) {
        let stream_id = job.id().to_string();

        let stdout_task = child.stdout.take().map(|out| tokio::spawn(drain(out)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(collect_stderr(stream_id.clone(), err)));

        let exit = tokio::select! {
            res = child.wait() => res,
            () = kill_switch.notified() => terminate(&stream_id, &mut child).await,
        };

        let (exit_code, failure) = exit_outcome(&exit);
        let failed = failure.is_some();
        let final_status = job.record_exit(exit_code, failure.clone()).await;
        match failure {
            None => {
                info!(stream_id = %stream_id, status = %final_status, "Relay finished successfully");
            }
            Some(cause) => {
                error!(
                    stream_id = %stream_id,
                    cause = %cause,
                    status = %final_status,
                    "Relay failed"
                );
            }
        }

        if let Some(task) = stdout_task {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await.is_err() {
                debug!(stream_id = %stream_id, "stdout still open after exit");
            }
        }
        if let Some(task) = stderr_task {
            match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
                Ok(Ok(tail)) if failed => {
                    for line in tail {
                        error!(stream_id = %stream_id, "ffmpeg stderr: {}", line);
                    }
                }
                Ok(_) => {}
                Err(_) => debug!(stream_id = %stream_id, "stderr still open after exit"),
            }
        }
    }
}

/// Exit code and failure cause for a finished wait. A clean exit has no cause.
fn exit_outcome(exit: &io::Result<ExitStatus>) -> (Option<i32>, Option<String>) {
    match exit {
        Ok(status) if status.success() => (status.code(), None),
        Ok(status) => (status.code(), Some(format!("relay exited with {status}"))),
        Err(e) => (None, Some(format!("failed to wait for relay: {e}"))),
    }
}

/// SIGTERM the relay so ffmpeg can finalize its output, then kill it if it is
/// still running after [`TERM_GRACE`].
///
/// Runs before the child is reaped, so its pid cannot have been reused.
async fn terminate(stream_id: &str, child: &mut Child) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to our unreaped Child; kill(2) with SIGTERM
            // has no memory-safety preconditions.
            #[allow(unsafe_code)]
            #[allow(clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret == 0 {
                if let Ok(res) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
                    return res;
                }
                warn!(stream_id, "Relay ignored SIGTERM, killing");
            } else {
                let e = io::Error::last_os_error();
                warn!(stream_id, error = %e, "Failed to signal relay");
            }
        }
    }
    if let Err(e) = child.start_kill() {
        warn!(stream_id, error = %e, "Failed to kill relay");
    }
    child.wait().await
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) {
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
}

/// Read stderr to the end, logging each line and keeping the last few.
async fn collect_stderr(stream_id: String, stderr: ChildStderr) -> Vec<String> {
    let mut reader = BufReader::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                debug!(stream_id = %stream_id, "stderr: {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) => {
                warn!(stream_id = %stream_id, error = %e, "Failed reading relay stderr");
                break;
            }
        }
    }
    tail.into()
}
