use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{FaceLocalizer, FrameOutcome, Pipeline, PipelineConfig};
use facegate_hw::{frame::SNAPSHOT_QUALITY, Camera, CameraSource};
use std::path::PathBuf;

// `#[zbus::proxy]` generates `RecognizerProxy` (async) and `RecognizerProxyBlocking`.
#[zbus::proxy(
    interface = "org.facegate.Recognizer1",
    default_service = "org.facegate.Recognizer1",
    default_path = "/org/facegate/Recognizer1"
)]
trait Recognizer {
    async fn recognize(&self) -> zbus::Result<String>;
    async fn recognize_image(&self, path: &str) -> zbus::Result<String>;
    async fn enroll(&self, name: &str) -> zbus::Result<String>;
    async fn cancel_enroll(&self) -> zbus::Result<bool>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn set_threshold(&self, threshold: f64) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face recognition CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face samples and enroll them under a name
    Enroll {
        /// Display name of the identity
        name: String,
    },
    /// Cancel a running enrollment
    Cancel,
    /// Recognize the face currently in front of the camera
    Recognize,
    /// Recognize a still image locally, without the daemon
    Identify {
        /// Image file (PNG, JPEG, ...)
        image: PathBuf,
        /// Data directory holding labels and the trained model
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Haar cascade XML
        #[arg(long)]
        cascade: Option<PathBuf>,
    },
    /// List enrolled identities
    List,
    /// Show or set the acceptance threshold
    Threshold {
        /// New threshold (maximum accepted distance)
        value: Option<f64>,
    },
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Capture device index
        #[arg(long, default_value_t = 0)]
        camera: u32,
        /// Where to write a JPEG snapshot
        #[arg(long, default_value = "facegate-test.jpg")]
        snapshot: PathBuf,
        /// Haar cascade XML used to check detection on the snapshot
        #[arg(long)]
        cascade: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identify { image, data_dir, cascade } => {
            let defaults = PipelineConfig::default();
            let pipeline = Pipeline::initialize(PipelineConfig {
                data_dir: data_dir.unwrap_or(defaults.data_dir),
                cascade_path: cascade.unwrap_or(defaults.cascade_path),
            })?;
            let outcome = pipeline
                .recognize_image(&image)
                .with_context(|| format!("failed to recognize {}", image.display()))?;
            println!("{}", frame_outcome_summary(&outcome));
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Test { camera, snapshot, cascade } => run_diagnostics(camera, &snapshot, cascade)?,
        command => {
            let conn = if cli.system {
                zbus::Connection::system().await?
            } else {
                zbus::Connection::session().await?
            };
            let proxy = RecognizerProxy::new(&conn)
                .await
                .context("facegated is not reachable on D-Bus")?;
            run_remote(&proxy, command).await?;
        }
    }

    Ok(())
}

async fn run_remote(proxy: &RecognizerProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Enroll { name } => {
            println!("Enrolling {name}; look at the camera...");
            let identity: serde_json::Value = serde_json::from_str(&proxy.enroll(&name).await?)?;
            println!("Enrolled {} as id {}", identity["name"], identity["id"]);
        }
        Commands::Cancel => {
            if proxy.cancel_enroll().await? {
                println!("Enrollment cancelled");
            } else {
                println!("No enrollment running");
            }
        }
        Commands::Recognize => {
            let outcome: FrameOutcome = serde_json::from_str(&proxy.recognize().await?)?;
            println!("{}", frame_outcome_summary(&outcome));
        }
        Commands::List => {
            let identities: Vec<facegate_core::Identity> = serde_json::from_str(&proxy.list_identities().await?)?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in identities {
                println!("{:>4}  {}", identity.id, identity.name);
            }
        }
        Commands::Threshold { value: Some(value) } => {
            proxy.set_threshold(value).await?;
            println!("Threshold set to {value}");
        }
        Commands::Threshold { value: None } => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("Threshold: {}", status["threshold"]);
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Identify { .. } | Commands::Test { .. } => bail!("command runs locally"),
    }
    Ok(())
}

fn frame_outcome_summary(outcome: &FrameOutcome) -> String {
    match outcome {
        FrameOutcome::NoFace => "No face detected".to_string(),
        FrameOutcome::Classified { result, .. } => match result.identity() {
            Some(identity) => format!(
                "Recognized {} (id {}, distance {:.2} <= {:.2})",
                identity.name, identity.id, result.distance, result.threshold
            ),
            None => format!(
                "Unknown face (nearest id {}, distance {:.2} > {:.2})",
                result.nearest_id, result.distance, result.threshold
            ),
        },
    }
}

/// Open the camera directly, report what it negotiates and save a snapshot.
fn run_diagnostics(index: u32, snapshot: &std::path::Path, cascade: Option<PathBuf>) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for dev in &devices {
        println!("  {}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
    }

    let source = CameraSource::new(index).with_warmup(4);
    tracing::debug!(device = %source.device_path(), "opening camera for diagnostics");
    let frame = source.capture_frame()?;
    let format = source.with_camera(|camera| Ok(camera.pixel_format()))?;
    println!(
        "Captured {}x{} {:?} frame (seq {}), brightness {:.1}{}",
        frame.width,
        frame.height,
        format,
        frame.sequence,
        frame.avg_brightness(),
        if frame.is_dark { ", DARK" } else { "" }
    );

    std::fs::write(snapshot, frame.to_jpeg(SNAPSHOT_QUALITY)?)
        .with_context(|| format!("failed to write {}", snapshot.display()))?;
    println!("Snapshot written to {}", snapshot.display());

    let cascade = cascade.unwrap_or_else(|| PathBuf::from(facegate_core::DEFAULT_CASCADE_PATH));
    match FaceLocalizer::load(&cascade) {
        Ok(localizer) => {
            let gray = facegate_core::imgproc::rgb_to_gray(&frame.rgb, frame.width, frame.height)?;
            match localizer.detect_largest_face(&gray)?.face_box() {
                Some(face) => println!("Face found at {face:?}"),
                None => println!("No face found in snapshot"),
            }
        }
        Err(e) => println!("Detection skipped: {e}"),
    }
    Ok(())
}
