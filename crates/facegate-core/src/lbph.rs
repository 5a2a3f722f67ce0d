//! Local Binary Pattern Histograms, backed by OpenCV's `face` module.
//!
//! Radius 1, 8 samples, an 8×8 grid of 256-bin cells; prediction is the
//! nearest stored histogram under the alternative chi-square distance.
//! The OpenCV threshold is left open so the caller sees every distance
//! and applies its own calibrated gate.

use crate::imgproc;
use crate::recognizer::RecognizerError;
use crate::types::{CancelToken, FaceRoi, Prediction};
use chrono::{DateTime, Utc};
use opencv::core::{Mat, Ptr, Vector};
use opencv::face::{FaceRecognizerTrait, FaceRecognizerTraitConst, LBPHFaceRecognizer, LBPHFaceRecognizerTraitConst};
use opencv::prelude::MatTraitConst;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

pub const LBPH_RADIUS: i32 = 1;
pub const LBPH_NEIGHBORS: i32 = 8;
pub const LBPH_GRID_X: i32 = 8;
pub const LBPH_GRID_Y: i32 = 8;

/// Hyperparameters baked into a trained model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LbphParams {
    pub radius: i32,
    pub neighbors: i32,
    pub grid_x: i32,
    pub grid_y: i32,
}

impl LbphParams {
    pub const FIXED: LbphParams = LbphParams {
        radius: LBPH_RADIUS,
        neighbors: LBPH_NEIGHBORS,
        grid_x: LBPH_GRID_X,
        grid_y: LBPH_GRID_Y,
    };

    fn create(&self) -> opencv::Result<Ptr<LBPHFaceRecognizer>> {
        LBPHFaceRecognizer::create(self.radius, self.neighbors, self.grid_x, self.grid_y, f64::MAX)
    }
}

/// Trained LBPH state.
pub struct LbphModel {
    params: LbphParams,
    trained_at: DateTime<Utc>,
    labels: Vec<i32>,
    recognizer: Mutex<Ptr<LBPHFaceRecognizer>>,
}

impl LbphModel {
    /// Build a model from labelled patches. Needs at least one sample.
    ///
    /// `cancel` is polled while the patches are staged; a cancelled fit
    /// returns [`RecognizerError::Cancelled`] and produces nothing.
    pub fn fit(samples: &[(FaceRoi, i32)], cancel: &CancelToken) -> Result<Self, RecognizerError> {
        Self::fit_with(LbphParams::FIXED, samples, cancel)
    }

    pub(crate) fn fit_with(
        params: LbphParams,
        samples: &[(FaceRoi, i32)],
        cancel: &CancelToken,
    ) -> Result<Self, RecognizerError> {
        if samples.is_empty() {
            return Err(RecognizerError::InsufficientData);
        }

        let mut images = Vector::<Mat>::with_capacity(samples.len());
        let mut labels = Vec::with_capacity(samples.len());
        for (roi, label) in samples {
            if cancel.is_cancelled() {
                tracing::info!(done = labels.len(), total = samples.len(), "training cancelled");
                return Err(RecognizerError::Cancelled);
            }
            images.push(imgproc::roi_to_mat(roi)?);
            labels.push(*label);
        }

        let mut recognizer = params.create()?;
        recognizer.train(&images, &Vector::<i32>::from_slice(&labels))?;

        let model = Self {
            params,
            trained_at: Utc::now(),
            labels,
            recognizer: Mutex::new(recognizer),
        };
        tracing::info!(
            samples = model.sample_count(),
            identities = model.labels().len(),
            "LBPH model fitted"
        );
        Ok(model)
    }

    /// Nearest stored sample and its distance.
    pub fn predict(&self, roi: &FaceRoi) -> Result<Prediction, RecognizerError> {
        let query = imgproc::roi_to_mat(roi)?;
        let (mut label, mut distance) = (-1, f64::MAX);
        self.recognizer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .predict(&query, &mut label, &mut distance)?;
        if label < 0 {
            return Err(RecognizerError::Corrupt("model has no samples".into()));
        }
        Ok(Prediction { label, distance })
    }

    pub fn params(&self) -> LbphParams {
        self.params
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn sample_count(&self) -> usize {
        self.labels.len()
    }

    /// Identity ids referenced by the model.
    pub fn labels(&self) -> BTreeSet<i32> {
        self.labels.iter().copied().collect()
    }

    /// Per-sample labels in training order.
    pub(crate) fn labels_in_order(&self) -> &[i32] {
        &self.labels
    }

    /// OpenCV's YAML serialisation of histograms and labels.
    pub(crate) fn export_state(&self) -> Result<Vec<u8>, RecognizerError> {
        let scratch = tempfile::Builder::new().prefix("facegate-lbph").suffix(".yml").tempfile()?;
        let path = scratch_path(&scratch)?;
        let recognizer = self.recognizer.lock().unwrap_or_else(PoisonError::into_inner);
        FaceRecognizerTraitConst::write(&*recognizer, path)?;
        Ok(std::fs::read(scratch.path())?)
    }

    /// Rebuild a model from [`LbphModel::export_state`] output.
    ///
    /// The state must agree with `params` and `labels`.
    pub(crate) fn import_state(
        params: LbphParams,
        trained_at: DateTime<Utc>,
        labels: Vec<i32>,
        state: &[u8],
    ) -> Result<Self, RecognizerError> {
        let mut scratch = tempfile::Builder::new().prefix("facegate-lbph").suffix(".yml").tempfile()?;
        scratch.write_all(state)?;
        scratch.flush()?;

        let mut recognizer = params.create()?;
        FaceRecognizerTrait::read(&mut recognizer, scratch_path(&scratch)?)
            .map_err(|e| RecognizerError::Corrupt(format!("recognizer state: {e}")))?;

        let stored = LbphParams {
            radius: recognizer.get_radius()?,
            neighbors: recognizer.get_neighbors()?,
            grid_x: recognizer.get_grid_x()?,
            grid_y: recognizer.get_grid_y()?,
        };
        if stored != params {
            return Err(RecognizerError::Corrupt(format!(
                "recognizer state has {stored:?}, header says {params:?}"
            )));
        }

        let state_labels = recognizer.get_labels()?;
        let state_labels: Vec<i32> = if state_labels.empty() {
            Vec::new()
        } else {
            state_labels.data_typed::<i32>()?.to_vec()
        };
        let histograms = recognizer.get_histograms()?.len();
        if labels.is_empty() || state_labels != labels || histograms != labels.len() {
            return Err(RecognizerError::Corrupt("missing or truncated histograms".into()));
        }

        Ok(Self {
            params,
            trained_at,
            labels,
            recognizer: Mutex::new(recognizer),
        })
    }
}

fn scratch_path(file: &tempfile::NamedTempFile) -> Result<&str, RecognizerError> {
    file.path()
        .to_str()
        .ok_or_else(|| RecognizerError::Corrupt("scratch path is not UTF-8".into()))
}
