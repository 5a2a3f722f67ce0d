use crate::engine::{EngineError, EngineHandle};
use facegate_core::{CancelToken, Pipeline, PipelineError, RecognizerError};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use zbus::interface;

/// D-Bus interface for the facegate recognition daemon.
///
/// Bus name: org.facegate.Recognizer1
/// Object path: /org/facegate/Recognizer1
pub struct RecognizerService {
    pub engine: EngineHandle,
    pub pipeline: Arc<Pipeline>,
    pub camera_device: String,
    pub samples_per_enroll: usize,
    /// Token of the enrollment in progress, if any.
    pub active_enroll: Mutex<Option<CancelToken>>,
}

#[interface(name = "org.facegate.Recognizer1")]
impl RecognizerService {
    /// Capture a frame and classify the largest face. Returns the outcome as JSON.
    async fn recognize(&self) -> zbus::fdo::Result<String> {
        tracing::info!("recognize requested");
        let outcome = self.engine.recognize().await.map_err(engine_to_fdo)?;
        to_json(&outcome)
    }

    /// Classify the largest face in a still image on the daemon's filesystem.
    async fn recognize_image(&self, path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(path, "recognize_image requested");
        let pipeline = Arc::clone(&self.pipeline);
        let path = PathBuf::from(path);
        let outcome = tokio::task::spawn_blocking(move || pipeline.recognize_image(&path))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("recognition task failed: {e}")))?
            .map_err(pipeline_to_fdo)?;
        to_json(&outcome)
    }

    /// Capture face samples and enroll them under `name`. Returns the identity as JSON.
    async fn enroll(&self, name: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, samples = self.samples_per_enroll, "enroll requested");
        let cancel = CancelToken::new();
        {
            let mut active = self.active_enroll.lock().unwrap_or_else(PoisonError::into_inner);
            if active.is_some() {
                return Err(zbus::fdo::Error::LimitsExceeded("an enrollment is already running".into()));
            }
            *active = Some(cancel.clone());
        }

        let result = self
            .engine
            .enroll(name.to_owned(), self.samples_per_enroll, cancel)
            .await;
        *self.active_enroll.lock().unwrap_or_else(PoisonError::into_inner) = None;

        let identity = result.map_err(engine_to_fdo)?;
        tracing::info!(id = identity.id, name = %identity.name, "enroll complete");
        to_json(&identity)
    }

    /// Cancel the running enrollment. Returns false if none was running.
    async fn cancel_enroll(&self) -> bool {
        match self.active_enroll.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(token) => {
                token.cancel();
                tracing::info!("enroll cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Enrolled identities as a JSON array of `{id, name}`.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        to_json(&self.pipeline.identities())
    }

    /// Persist a new acceptance threshold.
    async fn set_threshold(&self, threshold: f64) -> zbus::fdo::Result<()> {
        tracing::info!(threshold, "set_threshold requested");
        match self.pipeline.set_threshold(threshold) {
            Ok(()) => Ok(()),
            Err(PipelineError::Threshold(e @ facegate_core::threshold::ThresholdError::NotFinite(_))) => {
                Err(zbus::fdo::Error::InvalidArgs(e.to_string()))
            }
            Err(e) => Err(pipeline_to_fdo(e)),
        }
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let consistency = match self.pipeline.check_consistency() {
            Ok(()) => "ok".to_string(),
            Err(e) => e.to_string(),
        };
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera_device,
            "data_dir": self.pipeline.layout().data_dir(),
            "trained": self.pipeline.is_trained(),
            "threshold": self.pipeline.threshold(),
            "identities": self.pipeline.identities().len(),
            "enrolling": self.active_enroll.lock().unwrap_or_else(PoisonError::into_inner).is_some(),
            "consistency": consistency,
        })
        .to_string())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("encoding failed: {e}")))
}

fn engine_to_fdo(err: EngineError) -> zbus::fdo::Error {
    tracing::warn!(error = %err, "request failed");
    match err {
        EngineError::Pipeline(e) => pipeline_to_fdo(e),
        EngineError::Camera(e) => zbus::fdo::Error::IOError(e.to_string()),
        EngineError::NoFaceDetected => zbus::fdo::Error::Failed(err.to_string()),
        EngineError::Cancelled => zbus::fdo::Error::Failed(err.to_string()),
        EngineError::ChannelClosed => zbus::fdo::Error::ServiceUnknown(err.to_string()),
    }
}

fn pipeline_to_fdo(err: PipelineError) -> zbus::fdo::Error {
    match err {
        PipelineError::Recognizer(RecognizerError::NotTrained(_)) => zbus::fdo::Error::NotSupported(err.to_string()),
        PipelineError::EmptyName | PipelineError::Recognizer(RecognizerError::InsufficientData) => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        PipelineError::Image(_) => zbus::fdo::Error::FileNotFound(err.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}
