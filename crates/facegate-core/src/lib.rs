//! facegate-core: Face localisation and recognition engine.
//!
//! Finds the largest face with a Haar cascade, normalises it to a 200×200
//! grayscale patch and classifies it with an LBPH model against enrolled
//! identities. Pure CPU, no hardware access.

pub mod detector;
pub mod imgproc;
pub mod labels;
pub mod layout;
pub mod lbph;
pub mod normalize;
pub mod pipeline;
pub mod recognizer;
pub mod samples;
pub mod threshold;
pub mod types;

#[cfg(test)]
mod fixtures;

use std::path::PathBuf;

pub use detector::{CascadeError, FaceLocalizer};
pub use labels::{LabelMap, LabelStore};
pub use layout::DataLayout;
pub use normalize::prepare_face_roi;
pub use pipeline::{Pipeline, PipelineConfig, PipelineError};
pub use recognizer::{RecognizerError, RecognizerModel};
pub use threshold::{ThresholdCalibrator, DEFAULT_THRESHOLD};
pub use types::{
    CancelToken, Detection, FaceBox, FaceRoi, FrameOutcome, GrayFrame, Identity, PreparedFace,
    RecognitionResult,
};

/// Stock OpenCV frontal-face cascade as installed by distribution packages.
pub const DEFAULT_CASCADE_PATH: &str = "/usr/share/opencv4/haarcascades/haarcascade_frontalface_default.xml";

/// `$XDG_DATA_HOME/facegate`, falling back to `~/.local/share/facegate`.
pub fn default_data_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("facegate");
    }
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".local/share/facegate")
}
