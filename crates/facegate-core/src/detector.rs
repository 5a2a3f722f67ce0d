//! Face localisation with an OpenCV Haar cascade.
//!
//! Parameters are fixed so that boxes stay comparable with the patches a
//! model was trained on.

use crate::imgproc::{self, BufferError};
use crate::types::{Detection, FaceBox, GrayFrame};
use opencv::core::{Rect, Size, Vector};
use opencv::objdetect::CascadeClassifier;
use opencv::prelude::*;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

// --- Named constants (no magic numbers) ---
pub const SCALE_FACTOR: f64 = 1.2;
pub const MIN_NEIGHBORS: i32 = 5;
pub const MIN_FACE_SIZE: u32 = 80;

#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("cascade file not found: {0}")]
    NotFound(String),
    #[error("cascade {0} is not a usable classifier")]
    Unusable(String),
    #[error("failed to load cascade: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Cascade-based face localiser.
///
/// `detectMultiScale` mutates classifier scratch state, so calls are
/// serialised on the inner lock.
pub struct FaceLocalizer {
    classifier: Mutex<CascadeClassifier>,
}

impl FaceLocalizer {
    /// Load the cascade XML from the given path.
    pub fn load(cascade_path: &Path) -> Result<Self, CascadeError> {
        let display = cascade_path.display().to_string();
        if !cascade_path.exists() {
            return Err(CascadeError::NotFound(display));
        }
        let path = cascade_path
            .to_str()
            .ok_or_else(|| CascadeError::Unusable(display.clone()))?;

        let mut classifier = CascadeClassifier::default()?;
        if !classifier.load(path)? || classifier.empty()? {
            return Err(CascadeError::Unusable(display));
        }

        let window = classifier.get_original_window_size()?;
        tracing::info!(
            path = %display,
            window = ?(window.width, window.height),
            "loaded Haar cascade"
        );

        Ok(Self {
            classifier: Mutex::new(classifier),
        })
    }

    /// Every grouped face candidate, clipped to the frame and at least
    /// `MIN_FACE_SIZE` on each side, in detector order.
    pub fn detect_all(&self, gray: &GrayFrame) -> Result<Vec<FaceBox>, BufferError> {
        let image = imgproc::gray_to_mat(gray)?;
        let mut rects = Vector::<Rect>::new();
        self.classifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect_multi_scale(
                &image,
                &mut rects,
                SCALE_FACTOR,
                MIN_NEIGHBORS,
                0,
                Size::new(MIN_FACE_SIZE as i32, MIN_FACE_SIZE as i32),
                Size::new(0, 0),
            )?;

        let faces: Vec<FaceBox> = rects
            .iter()
            .filter_map(|r| clip(r, gray.width, gray.height))
            .filter(|b| b.width >= MIN_FACE_SIZE && b.height >= MIN_FACE_SIZE)
            .collect();

        tracing::debug!(
            raw = rects.len(),
            faces = faces.len(),
            width = gray.width,
            height = gray.height,
            "cascade scan complete"
        );

        Ok(faces)
    }

    /// The candidate with the largest area; ties keep the earliest candidate.
    pub fn detect_largest_face(&self, gray: &GrayFrame) -> Result<Detection, BufferError> {
        let mut best: Option<FaceBox> = None;
        for face in self.detect_all(gray)? {
            if best.map_or(true, |b| face.area() > b.area()) {
                best = Some(face);
            }
        }
        Ok(match best {
            Some(b) => Detection::Detected(b),
            None => Detection::NotFound,
        })
    }
}

/// Convert an OpenCV rectangle to a box inside a `width × height` frame.
fn clip(r: Rect, width: u32, height: u32) -> Option<FaceBox> {
    let x0 = r.x.max(0) as u32;
    let y0 = r.y.max(0) as u32;
    let x1 = (r.x.saturating_add(r.width)).max(0) as u32;
    let y1 = (r.y.saturating_add(r.height)).max(0) as u32;
    let (x1, y1) = (x1.min(width), y1.min(height));
    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    Some(FaceBox {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    fn gray_with_faces(width: u32, height: u32, faces: &[(u32, u32, u32)]) -> GrayFrame {
        let mut rgb = fixtures::blank_rgb(width, height);
        for &(x, y, size) in faces {
            fixtures::paint_face(&mut rgb, width, x, y, size);
        }
        imgproc::rgb_to_gray(&rgb, width, height).unwrap()
    }

    fn centre_inside(face: &FaceBox, x: u32, y: u32, size: u32) -> bool {
        let (cx, cy) = (face.x + face.width / 2, face.y + face.height / 2);
        (x..x + size).contains(&cx) && (y..y + size).contains(&cy)
    }

    #[test]
    fn test_load_missing_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let err = FaceLocalizer::load(&dir.path().join("absent.xml")).err().unwrap();
        assert!(matches!(err, CascadeError::NotFound(_)), "got {err:?}");
    }

    #[test]
    fn test_load_rejects_non_cascade() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.xml");
        std::fs::write(&path, "<?xml version=\"1.0\"?>\n<opencv_storage>\n</opencv_storage>\n").unwrap();
        let err = FaceLocalizer::load(&path).err().unwrap();
        assert!(
            matches!(err, CascadeError::Unusable(_) | CascadeError::OpenCv(_)),
            "got {err:?}"
        );
    }

    #[test]
    fn test_blank_frame_not_found() {
        let gray = gray_with_faces(320, 240, &[]);
        assert_eq!(fixtures::localizer().detect_largest_face(&gray).unwrap(), Detection::NotFound);
    }

    #[test]
    fn test_single_face_within_bounds() {
        let gray = gray_with_faces(320, 240, &[(100, 60, 120)]);
        let face = match fixtures::localizer().detect_largest_face(&gray).unwrap() {
            Detection::Detected(b) => b,
            Detection::NotFound => panic!("expected a face"),
        };
        assert!(face.fits_within(320, 240), "box {face:?} outside frame");
        assert!(face.width >= MIN_FACE_SIZE && face.height >= MIN_FACE_SIZE, "box {face:?} too small");
        assert!(centre_inside(&face, 100, 60, 120), "box {face:?} off target");
    }

    #[test]
    fn test_largest_of_multiple_faces() {
        let gray = gray_with_faces(640, 480, &[(30, 30, 85), (300, 120, 300)]);
        let loc = fixtures::localizer();

        let all = loc.detect_all(&gray).unwrap();
        assert!(!all.is_empty());
        let face = loc.detect_largest_face(&gray).unwrap().face_box().unwrap();
        for other in &all {
            assert!(face.area() >= other.area(), "{face:?} smaller than {other:?}");
        }
        assert!(
            centre_inside(&face, 300, 120, 300),
            "largest box {face:?} should sit on the big face"
        );
    }

    #[test]
    fn test_detection_is_deterministic() {
        let gray = gray_with_faces(320, 240, &[(150, 90, 110)]);
        let loc = fixtures::localizer();
        assert_eq!(loc.detect_all(&gray).unwrap(), loc.detect_all(&gray).unwrap());
    }

    #[test]
    fn test_clip_to_frame() {
        let b = |x, y, w, h| FaceBox { x, y, width: w, height: h };
        assert_eq!(clip(Rect::new(250, 200, 100, 100), 320, 240), Some(b(250, 200, 70, 40)));
        assert_eq!(clip(Rect::new(-10, 5, 100, 100), 320, 240), Some(b(0, 5, 90, 100)));
        assert_eq!(clip(Rect::new(320, 0, 10, 10), 320, 240), None);
    }
}
