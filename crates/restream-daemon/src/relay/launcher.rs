//! ffmpeg relay process launcher.
//!
//! Builds the fixed encoding profile used for every relay and spawns the
//! process with captured output.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{info, warn};

use restream_core::config::RelayConfig;

/// Placeholder shown in logs instead of the destination key.
const REDACTED_KEY: &str = "<redacted>";

/// Encoding profile applied to every relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeProfile {
    pub video_codec: &'static str,
    pub preset: &'static str,
    pub max_rate: &'static str,
    pub buf_size: &'static str,
    pub pixel_format: &'static str,
    pub gop: u32,
    pub audio_codec: &'static str,
    pub audio_bitrate: &'static str,
    pub audio_channels: u32,
    pub audio_sample_rate: u32,
    pub container: &'static str,
}

/// The live ingest profile: H.264 veryfast capped at 3000k, AAC 160k stereo, FLV.
pub const LIVE_PROFILE: EncodeProfile = EncodeProfile {
    video_codec: "libx264",
    preset: "veryfast",
    max_rate: "3000k",
    buf_size: "6000k",
    pixel_format: "yuv420p",
    gop: 50,
    audio_codec: "aac",
    audio_bitrate: "160k",
    audio_channels: 2,
    audio_sample_rate: 44100,
    container: "flv",
};

/// Build the ingest URL for a destination key.
pub fn ingest_url(base: &str, destination_key: &str) -> String {
    format!("{}/{destination_key}", base.trim_end_matches('/'))
}

/// Build the ffmpeg argument vector for one relay.
pub fn relay_args(profile: &EncodeProfile, source: &Path, url: &str) -> Vec<OsString> {
    // -re: read input at native frame rate so the ingest sees live pacing.
    let mut args: Vec<OsString> = vec!["-re".into(), "-i".into(), source.as_os_str().to_owned()];
    let options = [
        ("-c:v", profile.video_codec.to_string()),
        ("-preset", profile.preset.to_string()),
        ("-maxrate", profile.max_rate.to_string()),
        ("-bufsize", profile.buf_size.to_string()),
        ("-pix_fmt", profile.pixel_format.to_string()),
        ("-g", profile.gop.to_string()),
        ("-c:a", profile.audio_codec.to_string()),
        ("-b:a", profile.audio_bitrate.to_string()),
        ("-ac", profile.audio_channels.to_string()),
        ("-ar", profile.audio_sample_rate.to_string()),
        ("-f", profile.container.to_string()),
    ];
    for (flag, value) in options {
        args.push(flag.into());
        args.push(value.into());
    }
    args.push(url.into());
    args
}

/// Errors from launching a relay process.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Relay executable not found: {program}")]
    NotFound { program: String },

    #[error("Permission denied executing {program}")]
    PermissionDenied { program: String },

    #[error("Failed to spawn relay: {reason}")]
    Spawn { reason: String },
}

impl LaunchError {
    fn from_io(program: &Path, err: &io::Error) -> Self {
        let program = program.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound { program },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { program },
            _ => Self::Spawn {
                reason: err.to_string(),
            },
        }
    }
}

/// Signals a running relay without owning its `Child`.
#[derive(Debug, Clone)]
pub struct ProcessControl {
    pid: Option<u32>,
    kill_switch: Arc<Notify>,
}

impl ProcessControl {
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the relay to exit.
    ///
    /// The watcher owning the `Child` delivers the signal, so a relay that was
    /// already reaped is never signalled through a stale pid.
    pub fn terminate(&self) {
        self.kill_switch.notify_one();
    }

    pub(crate) fn kill_switch(&self) -> Arc<Notify> {
        Arc::clone(&self.kill_switch)
    }
}

/// A freshly spawned relay.
#[derive(Debug)]
pub struct RelayProcess {
    /// The child; its stdout/stderr are piped.
    pub child: Child,
    pub control: ProcessControl,
}

/// Spawns ffmpeg relay processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    ffmpeg_bin: PathBuf,
    ingest_url: String,
    launch_prefix: Vec<String>,
    profile: EncodeProfile,
}

impl ProcessLauncher {
    /// Create a launcher from relay configuration using [`LIVE_PROFILE`].
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            ffmpeg_bin: config.ffmpeg_bin.clone(),
            ingest_url: config.ingest_url.clone(),
            launch_prefix: config.launch_prefix.clone(),
            profile: LIVE_PROFILE,
        }
    }

    /// Program and full argument list, including any launch prefix.
    fn command_line(&self, source: &Path, url: &str) -> (PathBuf, Vec<OsString>) {
        let relay = relay_args(&self.profile, source, url);
        match self.launch_prefix.split_first() {
            Some((program, prefix_args)) => {
                let mut args: Vec<OsString> = prefix_args.iter().map(OsString::from).collect();
                args.push(self.ffmpeg_bin.clone().into_os_string());
                args.extend(relay);
                (PathBuf::from(program), args)
            }
            None => (self.ffmpeg_bin.clone(), relay),
        }
    }

    /// Spawn a relay of `source` to the channel identified by `destination_key`.
    ///
    /// Returns as soon as the process exists; it does not wait for ffmpeg to
    /// connect to the ingest.
    pub fn launch(
        &self,
        source: &Path,
        destination_key: &str,
    ) -> Result<RelayProcess, LaunchError> {
        let url = ingest_url(&self.ingest_url, destination_key);
        let (program, args) = self.command_line(source, &url);

        let (_, logged_args) =
            self.command_line(source, &ingest_url(&self.ingest_url, REDACTED_KEY));
        info!(
            program = %program.display(),
            args = %join_args(&logged_args),
            "Spawning relay process"
        );

        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                warn!(program = %program.display(), error = %e, "Relay spawn failed");
                LaunchError::from_io(&program, &e)
            })?;

        let control = ProcessControl {
            pid: child.id(),
            kill_switch: Arc::new(Notify::new()),
        };
        Ok(RelayProcess { child, control })
    }
}

fn join_args(args: &[OsString]) -> String {
    args.iter()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn strings(args: &[OsString]) -> Vec<String> {
        args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn ingest_url_appends_key() {
        assert_eq!(
            ingest_url("rtmp://a.rtmp.youtube.com/live2", "abc123"),
            "rtmp://a.rtmp.youtube.com/live2/abc123"
        );
        assert_eq!(ingest_url("rtmp://host/app/", "k"), "rtmp://host/app/k");
    }

    #[test]
    fn relay_args_follow_live_profile() {
        let args = relay_args(
            &LIVE_PROFILE,
            Path::new("/srv/uploads/clip.mp4"),
            "rtmp://a.rtmp.youtube.com/live2/abc123",
        );
        assert_eq!(
            strings(&args),
            vec![
                "-re", "-i", "/srv/uploads/clip.mp4", "-c:v", "libx264", "-preset", "veryfast",
                "-maxrate", "3000k", "-bufsize", "6000k", "-pix_fmt", "yuv420p", "-g", "50",
                "-c:a", "aac", "-b:a", "160k", "-ac", "2", "-ar", "44100", "-f", "flv",
                "rtmp://a.rtmp.youtube.com/live2/abc123",
            ]
        );
    }

    #[test]
    fn launch_prefix_wraps_relay_binary() {
        let launcher = ProcessLauncher::new(&RelayConfig {
            ffmpeg_bin: PathBuf::from("/usr/bin/ffmpeg"),
            launch_prefix: vec!["nice".into(), "-n".into(), "10".into()],
            ..RelayConfig::default()
        });
        let (program, args) = launcher.command_line(Path::new("in.mkv"), "rtmp://x/k");
        assert_eq!(program, PathBuf::from("nice"));
        let args = strings(&args);
        assert_eq!(&args[..5], &["-n", "10", "/usr/bin/ffmpeg", "-re", "-i"]);
        assert_eq!(args.last().unwrap(), "rtmp://x/k");
    }

    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let launcher = ProcessLauncher::new(&RelayConfig {
            ffmpeg_bin: PathBuf::from("/nonexistent/restream-test/ffmpeg"),
            ..RelayConfig::default()
        });
        let err = launcher.launch(Path::new("in.mp4"), "key").unwrap_err();
        assert!(matches!(err, LaunchError::NotFound { .. }), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_executable_binary_is_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("ffmpeg");
        std::fs::write(&bin, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o644)).unwrap();

        let launcher = ProcessLauncher::new(&RelayConfig {
            ffmpeg_bin: bin,
            ..RelayConfig::default()
        });
        let err = launcher.launch(Path::new("in.mp4"), "key").unwrap_err();
        assert!(matches!(err, LaunchError::PermissionDenied { .. }), "got {err:?}");
    }
}
