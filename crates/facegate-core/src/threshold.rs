//! Acceptance threshold persisted in `model_meta.json`.
//!
//! Reading never fails: any problem with the file degrades to
//! [`DEFAULT_THRESHOLD`]. Writing reports I/O errors.

use crate::layout::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Maximum chi-square distance accepted as a match when nothing is calibrated.
pub const DEFAULT_THRESHOLD: f64 = 60.0;

#[derive(Error, Debug)]
pub enum ThresholdError {
    #[error("threshold must be a finite number, got {0}")]
    NotFinite(f64),
    #[error("metadata I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Calibration state stored next to the model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

pub struct ThresholdCalibrator {
    path: PathBuf,
}

impl ThresholdCalibrator {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The persisted threshold, or [`DEFAULT_THRESHOLD`] if it cannot be read.
    pub fn load_threshold(&self) -> f64 {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no threshold metadata, using default");
                return DEFAULT_THRESHOLD;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "unreadable threshold metadata, using default");
                return DEFAULT_THRESHOLD;
            }
        };

        match serde_json::from_slice::<ModelMetadata>(&bytes) {
            Ok(meta) if meta.threshold.is_finite() => meta.threshold,
            Ok(meta) => {
                tracing::warn!(threshold = meta.threshold, "non-finite threshold, using default");
                DEFAULT_THRESHOLD
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "malformed threshold metadata, using default");
                DEFAULT_THRESHOLD
            }
        }
    }

    /// Overwrite the metadata with `threshold`.
    pub fn save_threshold(&self, threshold: f64) -> Result<(), ThresholdError> {
        if !threshold.is_finite() {
            return Err(ThresholdError::NotFinite(threshold));
        }
        let body = serde_json::to_vec_pretty(&ModelMetadata { threshold })?;
        write_atomic(&self.path, &body)?;
        tracing::info!(path = %self.path.display(), threshold, "threshold saved");
        Ok(())
    }
}
