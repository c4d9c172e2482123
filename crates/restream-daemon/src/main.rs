//! restream daemon
//!
//! Accepts video uploads over HTTP and relays each one to an RTMP ingest
//! through an ffmpeg subprocess.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

use restream_core::config::{Config, load_config};
use restream_core::tracing_init::{default_filter, init_tracing};
use restream_daemon::relay::{ProcessLauncher, StreamRegistry};
use restream_daemon::server::{AppState, build_router};
use restream_daemon::upload::UploadStore;

#[derive(Parser, Debug)]
#[command(name = "restream-daemon")]
#[command(version, about = "restream daemon - relay uploaded videos to live ingest")]
struct Args {
    /// HTTP bind address (overrides the config file)
    #[arg(long, env = "RESTREAM_ADDR")]
    addr: Option<SocketAddr>,

    /// Settings file, merged over the global settings
    #[arg(long, env = "RESTREAM_CONFIG")]
    config: Option<PathBuf>,

    /// Directory uploaded videos are written to
    #[arg(long, env = "RESTREAM_UPLOAD_DIR")]
    upload_dir: Option<PathBuf>,

    /// Path to the `ffmpeg` binary
    #[arg(long, env = "RESTREAM_FFMPEG_BIN")]
    ffmpeg_bin: Option<PathBuf>,

    /// RTMP ingest base URL; the stream key is appended
    #[arg(long, env = "RESTREAM_INGEST_URL")]
    ingest_url: Option<String>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "RESTREAM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "RESTREAM_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(addr) = self.addr {
            config.server.listen_addr = addr;
        }
        if let Some(dir) = self.upload_dir {
            config.server.upload_dir = dir;
        }
        if let Some(bin) = self.ffmpeg_bin {
            config.relay.ffmpeg_bin = bin;
        }
        if let Some(url) = self.ingest_url {
            config.relay.ingest_url = url;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        config.log.json |= self.log_json;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config);

    init_tracing(
        &default_filter("restream_daemon", &config.log.level),
        config.log.json,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.server.listen_addr,
        upload_dir = %config.server.upload_dir.display(),
        ffmpeg = %config.relay.ffmpeg_bin.display(),
        "Starting restream-daemon"
    );

    let uploads = UploadStore::new(config.server.upload_dir.clone());
    uploads.ensure().await?;

    let registry = StreamRegistry::new(ProcessLauncher::new(&config.relay));
    let app = build_router(AppState {
        registry: registry.clone(),
        uploads,
        max_upload_bytes: config.server.max_upload_bytes,
    });

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr).await?;

    // Notify systemd that the daemon is ready to serve (unix only).
    // The `true` parameter unsets $NOTIFY_SOCKET so relay subprocesses
    // don't accidentally notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    info!(addr = %config.server.listen_addr, "HTTP server ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let stopped = registry.stop_all().await;
    info!(stopped, "Daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        () = sigterm => {
            info!("Received SIGTERM shutdown signal");
        }
    }
}
