//! Reduce a color frame to the canonical 200×200 grayscale face patch.

use crate::detector::FaceLocalizer;
use crate::imgproc::{self, BufferError};
use crate::types::{Detection, FaceBox, FaceRoi, GrayFrame, PreparedFace, ROI_SIZE};

/// Convert an RGB24 frame to gray, localise the largest face and normalise it.
///
/// Returns `Ok(None)` when no face is found; a buffer that does not match
/// `width × height × 3` is an error.
pub fn prepare_face_roi(
    localizer: &FaceLocalizer,
    rgb: &[u8],
    width: u32,
    height: u32,
) -> Result<Option<PreparedFace>, BufferError> {
    let gray = imgproc::rgb_to_gray(rgb, width, height)?;
    prepare_gray(localizer, gray)
}

/// Same as [`prepare_face_roi`] for a frame that is already single-channel.
pub fn prepare_gray(localizer: &FaceLocalizer, gray: GrayFrame) -> Result<Option<PreparedFace>, BufferError> {
    match localizer.detect_largest_face(&gray)? {
        Detection::NotFound => Ok(None),
        Detection::Detected(face_box) => {
            let roi = normalize_region(&gray, &face_box)?;
            Ok(Some(PreparedFace { roi, face_box, gray }))
        }
    }
}

/// Crop `face_box` out of `gray` and area-resize it to `ROI_SIZE × ROI_SIZE`.
pub fn normalize_region(gray: &GrayFrame, face_box: &FaceBox) -> Result<FaceRoi, BufferError> {
    let region = imgproc::crop(gray, face_box)?;
    let patch = imgproc::resize_area(&region, ROI_SIZE, ROI_SIZE)?;
    FaceRoi::from_pixels(patch.data)
}
