use crate::imgproc::BufferError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Side length of the canonical face patch.
pub const ROI_SIZE: u32 = 200;

/// Face region in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// True if the box lies entirely within a `width × height` frame.
    #[cfg(test)]
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

/// Outcome of face localisation on one frame.
///
/// Absence is its own variant; it is never encoded as a zero-area box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    Detected(FaceBox),
    NotFound,
}

impl Detection {
    pub fn face_box(&self) -> Option<FaceBox> {
        match self {
            Detection::Detected(b) => Some(*b),
            Detection::NotFound => None,
        }
    }
}

/// Owned single-channel 8-bit image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl GrayFrame {
    /// Wrap a buffer, checking that it holds `width * height` bytes.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self, BufferError> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(BufferError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Uniform image filled with `value`.
    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            data: vec![value; width as usize * height as usize],
            width,
            height,
        }
    }
}

/// Canonical 200×200 grayscale face patch, the unit of training and prediction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaceRoi {
    data: Vec<u8>,
}

impl FaceRoi {
    /// Build a patch from exactly `ROI_SIZE * ROI_SIZE` row-major pixels.
    pub fn from_pixels(data: Vec<u8>) -> Result<Self, BufferError> {
        let expected = (ROI_SIZE * ROI_SIZE) as usize;
        if data.len() != expected {
            return Err(BufferError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { data })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }
}

/// Result of normalising a frame on which a face was found.
#[derive(Debug, Clone)]
pub struct PreparedFace {
    pub roi: FaceRoi,
    pub face_box: FaceBox,
    pub gray: GrayFrame,
}

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: i32,
    pub name: String,
}

/// Raw nearest-neighbour answer from the recognizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: i32,
    /// Chi-square dissimilarity; lower is more similar, unbounded above.
    pub distance: f64,
}

/// Outcome of classifying one face patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    /// Nearest enrolled identity, reported even when rejected.
    pub nearest_id: i32,
    pub distance: f64,
    pub threshold: f64,
    pub accepted: bool,
    /// Display name, present only when accepted.
    pub name: Option<String>,
}

impl RecognitionResult {
    pub fn identity(&self) -> Option<Identity> {
        match (&self.name, self.accepted) {
            (Some(name), true) => Some(Identity {
                id: self.nearest_id,
                name: name.clone(),
            }),
            _ => None,
        }
    }
}

/// The classification gate: accept iff `distance <= threshold`.
pub fn accepts(distance: f64, threshold: f64) -> bool {
    distance <= threshold
}

/// Per-frame terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FrameOutcome {
    NoFace,
    Classified {
        face_box: FaceBox,
        result: RecognitionResult,
    },
}

/// Cooperative cancellation flag shared between a trainer and its controller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_box_bounds() {
        let b = FaceBox { x: 10, y: 20, width: 80, height: 90 };
        assert_eq!(b.area(), 7200);
        assert!(b.fits_within(90, 110));
        assert!(!b.fits_within(89, 110));
    }

    #[test]
    fn test_detection_not_found_has_no_box() {
        assert_eq!(Detection::NotFound.face_box(), None);
        let b = FaceBox { x: 0, y: 0, width: 80, height: 80 };
        assert_eq!(Detection::Detected(b).face_box(), Some(b));
    }

    #[test]
    fn test_face_roi_requires_exact_size() {
        assert!(FaceRoi::from_pixels(vec![0; 200 * 200]).is_ok());
        assert!(FaceRoi::from_pixels(vec![0; 199 * 200]).is_err());
    }

    #[test]
    fn test_gate_is_inclusive() {
        assert!(accepts(60.0, 60.0));
        assert!(accepts(0.0, 60.0));
        assert!(!accepts(60.0001, 60.0));
    }

    #[test]
    fn test_identity_only_when_accepted() {
        let rejected = RecognitionResult {
            nearest_id: 1,
            distance: 90.0,
            threshold: 60.0,
            accepted: false,
            name: None,
        };
        assert!(rejected.identity().is_none());

        let accepted = RecognitionResult {
            accepted: true,
            distance: 12.0,
            name: Some("alice".into()),
            ..rejected
        };
        assert_eq!(
            accepted.identity(),
            Some(Identity { id: 1, name: "alice".into() })
        );
    }

    #[test]
    fn test_frame_outcome_json_tag() {
        let json = serde_json::to_string(&FrameOutcome::NoFace).unwrap();
        assert_eq!(json, r#"{"outcome":"no_face"}"#);
    }

    #[test]
    fn test_cancel_token_shared() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }
}
