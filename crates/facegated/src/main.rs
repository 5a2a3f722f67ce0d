use anyhow::{Context, Result};
use facegate_core::Pipeline;
use facegate_hw::CameraSource;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.facegate.Recognizer1";
const OBJECT_PATH: &str = "/org/facegate/Recognizer1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let config = config::Config::load()?;
    tracing::info!(
        camera = %config.camera_device(),
        data_dir = %config.data_dir.display(),
        cascade = %config.cascade_path.display(),
        system_bus = config.system_bus,
        "configuration loaded"
    );

    let pipeline = Arc::new(
        Pipeline::initialize(config.pipeline_config()).context("failed to initialise recognition pipeline")?,
    );
    if let Err(e) = pipeline.check_consistency() {
        tracing::warn!(error = %e, "label table and model are out of sync");
    }

    let source = CameraSource::new(config.camera_index).with_warmup(config.warmup_frames);
    let engine = engine::spawn_engine(source, Arc::clone(&pipeline));

    let service = dbus_interface::RecognizerService {
        engine,
        pipeline,
        camera_device: config.camera_device(),
        samples_per_enroll: config.samples_per_enroll,
        active_enroll: Mutex::new(None),
    };

    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facegated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
