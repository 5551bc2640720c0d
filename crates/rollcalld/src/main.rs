use anyhow::Result;
use rollcall_core::{AttendanceService, EmbeddingExtractor, ExtractorConfig};
use rollcall_store::SqliteStore;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{AttendanceInterface, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        normalization = ?config.normalization,
        threshold = config.match_threshold,
        sources = config.model_sources.len(),
        "configuration loaded"
    );

    let store = Arc::new(SqliteStore::open(&config.db_path).await?);

    let extractor = Arc::new(EmbeddingExtractor::new(
        ExtractorConfig {
            sources: config.model_sources.clone(),
            normalization: config.normalization,
            model_version: config.model_version.clone(),
        },
        config.inference_threads,
    ));

    // Warm the model in the background; requests retry the load if this fails.
    let preload = Arc::clone(&extractor);
    tokio::spawn(async move {
        if let Err(e) = preload.load().await {
            tracing::warn!(error = %e, "model preload failed; face recognition unavailable until a model loads");
        }
    });

    let engine = if config.camera_enabled {
        match engine::spawn_engine(&config.camera_device, config.warmup_frames) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(
                    device = %config.camera_device,
                    error = %e,
                    "capture source unavailable; only image-based requests will work"
                );
                None
            }
        }
    } else {
        tracing::info!("camera disabled via ROLLCALL_CAMERA_ENABLED=0");
        None
    };

    let service = Arc::new(AttendanceService::new(
        store,
        extractor,
        config.match_threshold,
    ));
    let interface = AttendanceInterface::new(service, engine, config.enroll_samples);

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, interface)?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
