//! sightingd - multi-camera sighting daemon
//!
//! This daemon:
//! 1. Loads configuration (file from --config / SIGHTING_CONFIG, then env overrides)
//! 2. Opens the sighting database and image store, and picks an alert sink
//! 3. Starts one pipeline per camera plus the tracker sweeper
//! 4. Serves the live-view API
//! 5. Logs per-camera health until Ctrl-C, then stops everything

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use sighting_kernel::{
    api::{ApiConfig, ApiServer},
    pipeline::Collaborators,
    storage::shared,
    AlertSink, FilesystemImageStore, FleetOrchestrator, LogAlertSink, SightingdConfig,
    SqliteRecordStore, TelegramAlertSink,
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "SIGHTING_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override the live-view API listen address.
    #[arg(long, value_name = "ADDR")]
    api_addr: Option<String>,
    /// Override the sighting database path.
    #[arg(long, value_name = "PATH")]
    db_path: Option<String>,
    /// Override the sighting image directory.
    #[arg(long, value_name = "DIR")]
    images_dir: Option<PathBuf>,
    /// Do not start the live-view API.
    #[arg(long)]
    no_api: bool,
    /// Seconds between per-camera health log lines.
    #[arg(long, default_value_t = 30)]
    health_interval_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = SightingdConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.api_addr {
        cfg.api_addr = addr;
    }
    if let Some(path) = args.db_path {
        cfg.db_path = path;
    }
    if let Some(dir) = args.images_dir {
        cfg.images_dir = dir;
    }

    let records = shared(SqliteRecordStore::open(&cfg.db_path)?);
    std::fs::create_dir_all(&cfg.images_dir).map_err(|e| {
        anyhow!(
            "failed to create image directory {}: {}",
            cfg.images_dir.display(),
            e
        )
    })?;
    let alerts: Arc<dyn AlertSink> = match cfg.telegram() {
        Some(settings) => Arc::new(TelegramAlertSink::new(settings)?),
        None => {
            log::warn!("telegram not configured; alerts go to the log only");
            Arc::new(LogAlertSink)
        }
    };
    let collaborators = Collaborators {
        images: Arc::new(FilesystemImageStore::new(cfg.images_dir.clone())),
        alerts,
        records: records.clone(),
    };

    let fleet = Arc::new(FleetOrchestrator::from_config(&cfg, collaborators)?);
    let started = fleet.start_all()?;
    log::info!(
        "sightingd running: {}/{} cameras started, database {}, images {}",
        started,
        fleet.camera_ids().len(),
        cfg.db_path,
        cfg.images_dir.display()
    );

    let api_handle = if args.no_api {
        None
    } else {
        let api_config = ApiConfig {
            addr: cfg.api_addr.clone(),
        };
        Some(ApiServer::new(api_config, fleet.clone(), records).spawn()?)
    };

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let health_interval = Duration::from_secs(args.health_interval_secs.max(1));
    loop {
        match rx.recv_timeout(health_interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                for status in fleet.status() {
                    log::info!(
                        "[{}] {:?} frames={} restarts={} fps={} queue={} dropped={} tracked={} sightings={}",
                        status.camera_id,
                        status.state,
                        status.frames_captured,
                        status.decoder_restarts,
                        status.fps,
                        status.queue_depth,
                        status.queue_dropped,
                        status.tracked_keys,
                        status.sightings
                    );
                }
            }
        }
    }

    log::info!("shutdown signal received, stopping cameras...");
    if let Some(handle) = api_handle {
        handle.stop()?;
    }
    fleet.stop_all()?;
    if !fleet.wait_stopped(SHUTDOWN_GRACE) {
        log::warn!("some camera workers did not stop within {:?}", SHUTDOWN_GRACE);
    }
    Ok(())
}
