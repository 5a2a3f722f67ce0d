use facegate_core::{CancelToken, FaceRoi, FrameOutcome, Identity, Pipeline, PipelineError};
use facegate_hw::{CameraError, CameraSource};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Frames read per enrollment attempt, as a multiple of the samples wanted.
const ENROLL_FRAME_BUDGET: usize = 5;
/// Frames requested from the camera per enrollment batch.
const ENROLL_BATCH: usize = 5;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("no face detected in any captured frame")]
    NoFaceDetected,
    #[error("enrollment cancelled")]
    Cancelled,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Recognize {
        reply: oneshot::Sender<Result<FrameOutcome, EngineError>>,
    },
    Enroll {
        name: String,
        samples: usize,
        cancel: CancelToken,
        reply: oneshot::Sender<Result<Identity, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture one frame and classify the largest face in it.
    pub async fn recognize(&self) -> Result<FrameOutcome, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Capture `samples` face patches and enroll them under `name`.
    pub async fn enroll(&self, name: String, samples: usize, cancel: CancelToken) -> Result<Identity, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                name,
                samples,
                cancel,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Spawn the engine on a dedicated OS thread that owns the camera.
///
/// The camera is checked once up front; a missing device is logged and
/// retried on every request rather than failing startup.
pub fn spawn_engine(source: CameraSource, pipeline: Arc<Pipeline>) -> EngineHandle {
    match source.acquire() {
        Ok(()) => tracing::info!(device = %source.device_path(), "camera ready"),
        Err(e) => tracing::warn!(error = %e, "camera not available yet; will retry on request"),
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("facegate-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Recognize { reply } => {
                        let _ = reply.send(run_recognize(&source, &pipeline));
                    }
                    EngineRequest::Enroll {
                        name,
                        samples,
                        cancel,
                        reply,
                    } => {
                        let _ = reply.send(run_enroll(&source, &pipeline, &name, samples, &cancel));
                    }
                }
            }
            source.close();
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle { tx }
}

fn run_recognize(source: &CameraSource, pipeline: &Pipeline) -> Result<FrameOutcome, EngineError> {
    let frame = source.capture_frame()?;
    tracing::debug!(
        seq = frame.sequence,
        brightness = frame.avg_brightness(),
        dark = frame.is_dark,
        "recognize: frame captured"
    );
    Ok(pipeline.recognize_frame(&frame.rgb, frame.width, frame.height)?)
}

/// Collect face patches from successive non-dark frames, then enroll them.
fn run_enroll(
    source: &CameraSource,
    pipeline: &Pipeline,
    name: &str,
    samples: usize,
    cancel: &CancelToken,
) -> Result<Identity, EngineError> {
    let wanted = samples.max(1);
    let budget = wanted * ENROLL_FRAME_BUDGET;
    let mut rois: Vec<FaceRoi> = Vec::with_capacity(wanted);
    let mut seen = 0usize;
    let mut dark_total = 0usize;

    while rois.len() < wanted && seen < budget {
        if cancel.is_cancelled() {
            tracing::info!(collected = rois.len(), "enroll: cancelled during capture");
            return Err(EngineError::Cancelled);
        }

        let (frames, dark_skipped) = source.capture_frames(ENROLL_BATCH)?;
        dark_total += dark_skipped;
        seen += frames.len() + dark_skipped;
        if frames.is_empty() && dark_skipped == 0 {
            break;
        }

        for frame in frames {
            if rois.len() >= wanted {
                break;
            }
            if let Some(prepared) = pipeline.prepare(&frame.rgb, frame.width, frame.height)? {
                rois.push(prepared.roi);
            }
        }
    }

    tracing::info!(collected = rois.len(), wanted, seen, dark_skipped = dark_total, "enroll: capture finished");
    if rois.is_empty() {
        return Err(EngineError::NoFaceDetected);
    }

    match pipeline.enroll(name, &rois, cancel) {
        Ok(identity) => Ok(identity),
        Err(PipelineError::Recognizer(facegate_core::RecognizerError::Cancelled)) => Err(EngineError::Cancelled),
        Err(e) => Err(e.into()),
    }
}
