use anyhow::{Context, Result};
use angler_core::detector::FaceDetector;
use angler_core::head_pose::LandmarkPoseEstimator;
use angler_core::recognizer::FaceRecognizer;
use angler_core::{Finalizer, IdentityStore, SharedExtractor};
use angler_hw::{Camera, CameraSettings};
use angler_store::SqliteStore;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{AnglerService, BUS_NAME, OBJECT_PATH};
use engine::{Engine, EngineParts, EngineSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("anglerd starting");

    let config = Config::from_env()?;

    // Open camera and load models synchronously (fail-fast)
    let camera = Camera::open(CameraSettings {
        device: config.camera_device.clone(),
        width: config.frame_width,
        height: config.frame_height,
        rotation: config.rotation,
        warmup_frames: config.warmup_frames,
        ..CameraSettings::default()
    })?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );

    let scrfd_path = config.scrfd_model_path();
    let pose_detector = FaceDetector::load(&scrfd_path)?;
    let locator = FaceDetector::load(&scrfd_path)?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let arcface_path = config.arcface_model_path();
    let recognizer = FaceRecognizer::load(&arcface_path)?;
    tracing::info!(path = %arcface_path, "ArcFace recognizer loaded");

    let store = Arc::new(
        SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening identity store at {}", config.db_path.display()))?,
    );
    tracing::info!(identities = store.count_identities()?, "identity store ready");

    let finalizer = Finalizer::new(
        locator,
        SharedExtractor::new(recognizer),
        Arc::clone(&store),
        config.declared_count,
    );
    let engine = Engine::spawn(
        EngineParts {
            camera,
            estimator: LandmarkPoseEstimator::new(pose_detector),
            finalizer,
        },
        EngineSettings {
            session: config.session.clone(),
            preview_dir: Some(config.preview_dir.clone()),
            frame_interval: Duration::ZERO,
        },
    )?;

    let service = AnglerService::new(engine.handle(), store);
    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let connection = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "anglerd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("anglerd shutting down");

    drop(connection);
    engine.shutdown().await;

    Ok(())
}
