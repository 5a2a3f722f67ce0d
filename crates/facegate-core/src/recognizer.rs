//! LBPH recognizer with durable, checksummed persistence.
//!
//! The in-memory model is shared-read: predictions clone an `Arc` snapshot
//! under a read lock. Installing a retrained model writes the file and swaps
//! the snapshot under the write lock, so a prediction never observes a
//! partially written model.

use crate::imgproc::BufferError;
use crate::layout::write_atomic;
use crate::lbph::{LbphModel, LbphParams};
use crate::types::{CancelToken, FaceRoi, Prediction};
use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

const MODEL_MAGIC: [u8; 8] = *b"FGLBPH\0\0";
const MODEL_FORMAT_VERSION: u32 = 2;
const MODEL_SIZE_LIMIT: u64 = 512 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("no trained model at {0}; enroll at least one identity first")]
    NotTrained(String),
    #[error("training needs at least one labelled sample")]
    InsufficientData,
    #[error("training cancelled")]
    Cancelled,
    #[error("model file is corrupt: {0}")]
    Corrupt(String),
    #[error("model was trained with {found:?}, expected {expected:?}")]
    Incompatible { found: LbphParams, expected: LbphParams },
    #[error("model I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("model encoding: {0}")]
    Encode(#[from] bincode::Error),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("OpenCV: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// On-disk wrapper: the payload is a bincode-encoded [`StoredModel`].
#[derive(Serialize, Deserialize)]
struct Envelope {
    magic: [u8; 8],
    version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredModel {
    params: LbphParams,
    trained_at: DateTime<Utc>,
    labels: Vec<i32>,
    /// OpenCV's own YAML dump of the recognizer.
    state: Vec<u8>,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MODEL_SIZE_LIMIT)
}

fn checksum(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

fn encode(model: &LbphModel) -> Result<Vec<u8>, RecognizerError> {
    let stored = StoredModel {
        params: model.params(),
        trained_at: model.trained_at(),
        labels: model.labels_in_order().to_vec(),
        state: model.export_state()?,
    };
    let payload = codec().serialize(&stored)?;
    let envelope = Envelope {
        magic: MODEL_MAGIC,
        version: MODEL_FORMAT_VERSION,
        checksum: checksum(&payload),
        payload,
    };
    Ok(codec().serialize(&envelope)?)
}

fn decode(bytes: &[u8]) -> Result<LbphModel, RecognizerError> {
    let envelope: Envelope = codec()
        .deserialize(bytes)
        .map_err(|e| RecognizerError::Corrupt(format!("envelope: {e}")))?;

    if envelope.magic != MODEL_MAGIC {
        return Err(RecognizerError::Corrupt("not a facegate model file".into()));
    }
    if envelope.version != MODEL_FORMAT_VERSION {
        return Err(RecognizerError::Corrupt(format!(
            "unsupported format version {}",
            envelope.version
        )));
    }
    if checksum(&envelope.payload) != envelope.checksum {
        return Err(RecognizerError::Corrupt("checksum mismatch".into()));
    }

    let stored: StoredModel = codec()
        .deserialize(&envelope.payload)
        .map_err(|e| RecognizerError::Corrupt(format!("payload: {e}")))?;

    if stored.params != LbphParams::FIXED {
        return Err(RecognizerError::Incompatible {
            found: stored.params,
            expected: LbphParams::FIXED,
        });
    }
    LbphModel::import_state(stored.params, stored.trained_at, stored.labels, &stored.state)
}

/// Lazily loaded, retrainable LBPH model bound to a file.
pub struct RecognizerModel {
    path: PathBuf,
    current: RwLock<Option<Arc<LbphModel>>>,
    // Held for the whole fit-and-install of a training run.
    training: Mutex<()>,
}

impl RecognizerModel {
    /// Bind to `path`. Nothing is read until the first prediction.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(None),
            training: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if a model is loaded or persisted.
    pub fn is_trained(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
            || self.path.exists()
    }

    /// The current model, reading it from disk on first use.
    ///
    /// Idempotent: concurrent callers share one load.
    pub fn load(&self) -> Result<Arc<LbphModel>, RecognizerError> {
        if let Some(model) = self.current.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Ok(Arc::clone(model));
        }

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(model) = guard.as_ref() {
            return Ok(Arc::clone(model));
        }
        if !self.path.exists() {
            return Err(RecognizerError::NotTrained(self.path.display().to_string()));
        }

        let bytes = std::fs::read(&self.path)?;
        let model = Arc::new(decode(&bytes)?);
        tracing::info!(
            path = %self.path.display(),
            samples = model.sample_count(),
            trained_at = %model.trained_at(),
            "loaded LBPH model"
        );
        *guard = Some(Arc::clone(&model));
        Ok(model)
    }

    /// Nearest enrolled identity and its distance.
    pub fn predict(&self, roi: &FaceRoi) -> Result<Prediction, RecognizerError> {
        self.load()?.predict(roi)
    }

    /// Replace the model with one fitted on `samples` and persist it.
    ///
    /// Training runs are exclusive; a second caller waits for the first
    /// to install its model.
    pub fn train(&self, samples: &[(FaceRoi, i32)], cancel: &CancelToken) -> Result<Arc<LbphModel>, RecognizerError> {
        let _training = self.training.lock().unwrap_or_else(PoisonError::into_inner);
        let model = LbphModel::fit(samples, cancel)?;
        if cancel.is_cancelled() {
            return Err(RecognizerError::Cancelled);
        }
        self.swap_in(model)
    }

    /// Persist `model` and make it the current snapshot.
    ///
    /// New predictions block until the swap completes; in-flight ones keep
    /// the snapshot they already hold.
    pub fn install(&self, model: LbphModel) -> Result<Arc<LbphModel>, RecognizerError> {
        let _training = self.training.lock().unwrap_or_else(PoisonError::into_inner);
        self.swap_in(model)
    }

    fn swap_in(&self, model: LbphModel) -> Result<Arc<LbphModel>, RecognizerError> {
        let bytes = encode(&model)?;
        let model = Arc::new(model);

        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        write_atomic(&self.path, &bytes)?;
        *guard = Some(Arc::clone(&model));

        tracing::info!(
            path = %self.path.display(),
            samples = model.sample_count(),
            bytes = bytes.len(),
            "persisted LBPH model"
        );
        Ok(model)
    }

    /// Identity ids referenced by the current model.
    pub fn labels(&self) -> Result<BTreeSet<i32>, RecognizerError> {
        Ok(self.load()?.labels())
    }

    /// Drop the in-memory copy; the next prediction reloads from disk.
    pub fn invalidate(&self) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
