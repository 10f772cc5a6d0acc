//! Roadwatch -- pothole detection on a moving vehicle with a ring-buffered
//! dashcam.
//!
//! Gyroscope samples feed a rolling RMS detector; debounced anomalies make
//! the trigger coordinator export the last few finalized dashcam segments.

pub mod api;
pub mod config;
pub mod detect;
pub mod monitor;
pub mod recorder;
pub mod sensor;
pub mod storage;
pub mod trigger;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{RecorderBackend, RoadwatchConfig};
use crate::detect::Detector;
use crate::monitor::{Monitor, MonitorParts};
use crate::recorder::command::{stop_grace_for, CommandRecorder};
use crate::recorder::synthetic::SyntheticRecorder;
use crate::recorder::{RingController, SegmentRecorder};
use crate::storage::{SqliteIndexStore, TriggerLog};
use crate::trigger::{FsClipExporter, TriggerAudit, TriggerSettings};

pub fn build_recorder(config: &RoadwatchConfig) -> Arc<dyn SegmentRecorder> {
    match config.recorder.backend {
        RecorderBackend::Synthetic => {
            Arc::new(SyntheticRecorder::new(config.recorder.synthetic_rate))
        }
        RecorderBackend::Command => {
            let finalize_timeout = Duration::from_millis(config.trigger.finalize_timeout_ms);
            Arc::new(
                CommandRecorder::new(config.recorder.program.clone(), config.recorder.args.clone())
                    .with_stop_grace(stop_grace_for(finalize_timeout)),
            )
        }
    }
}

/// Start the Roadwatch daemon: monitoring session plus the optional API
/// server. Returns after a shutdown signal once recording has stopped.
pub async fn serve(config: RoadwatchConfig) -> Result<()> {
    // 1. Storage
    tracing::info!(db_path = %config.storage.db_path, "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;
    let index_store = Arc::new(SqliteIndexStore::new(pool.clone()));
    let trigger_log = Arc::new(TriggerLog::new(pool));

    // 2. Ring controller
    let controller = RingController::open(&config.ring, build_recorder(&config), index_store)?;

    // 3. Detector and sensor
    let (detector, threshold) = Detector::from_config(&config.detector, &config.gate)
        .context("failed to build detector")?;
    let sensor = sensor::build_source(&config.sensor);

    // 4. Monitoring session
    let audit: Arc<dyn TriggerAudit> = trigger_log.clone();
    let monitor = Arc::new(Monitor::start(MonitorParts {
        detector,
        threshold,
        sensor,
        controller,
        exporter: Arc::new(FsClipExporter::new(config.trigger.export_dir.clone())),
        audit: Some(audit),
        trigger: TriggerSettings::from(&config.trigger),
        segment: Duration::from_millis(config.ring.segment_ms),
    }));

    // 5. API server
    if config.api.enabled {
        let addr: std::net::SocketAddr = config
            .api
            .bind
            .parse()
            .with_context(|| format!("invalid api.bind address {}", config.api.bind))?;
        let app = api::router(api::state::AppState {
            monitor: monitor.clone(),
            trigger_log: Some(trigger_log),
        });

        tracing::info!(%addr, "Roadwatch API listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    monitor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received terminate signal, shutting down"),
    }
}
