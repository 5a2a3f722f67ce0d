//! Pixel-level helpers on top of OpenCV: color conversion, cropping, and
//! area resampling. Frames travel as owned byte buffers and are wrapped in
//! a `Mat` only for the duration of an OpenCV call.

use crate::types::{FaceBox, FaceRoi, GrayFrame, ROI_SIZE};
use opencv::core::{Mat, Rect, Scalar, Size, CV_8UC1, CV_8UC3};
use opencv::imgproc;
use opencv::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("OpenCV: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Copy `data` into a new `rows × cols` matrix of element type `typ`.
fn mat_from_bytes(data: &[u8], rows: u32, cols: u32, typ: i32) -> Result<Mat, BufferError> {
    let mut mat = Mat::new_rows_cols_with_default(rows as i32, cols as i32, typ, Scalar::all(0.0))?;
    let dst = mat.data_bytes_mut()?;
    if dst.len() != data.len() {
        return Err(BufferError::InvalidLength {
            expected: dst.len(),
            actual: data.len(),
        });
    }
    dst.copy_from_slice(data);
    Ok(mat)
}

pub fn gray_to_mat(gray: &GrayFrame) -> Result<Mat, BufferError> {
    mat_from_bytes(&gray.data, gray.height, gray.width, CV_8UC1)
}

pub fn roi_to_mat(roi: &FaceRoi) -> Result<Mat, BufferError> {
    mat_from_bytes(roi.pixels(), ROI_SIZE, ROI_SIZE, CV_8UC1)
}

/// Copy a single-channel 8-bit matrix back into an owned frame.
pub fn mat_to_gray(mat: &Mat) -> Result<GrayFrame, BufferError> {
    let data = if mat.is_continuous() {
        mat.data_bytes()?.to_vec()
    } else {
        mat.try_clone()?.data_bytes()?.to_vec()
    };
    GrayFrame::new(data, mat.cols() as u32, mat.rows() as u32)
}

/// Convert packed RGB24 to single-channel intensity (BT.601 weights).
pub fn rgb_to_gray(rgb: &[u8], width: u32, height: u32) -> Result<GrayFrame, BufferError> {
    let expected = width as usize * height as usize * 3;
    if rgb.len() < expected {
        return Err(BufferError::InvalidLength {
            expected,
            actual: rgb.len(),
        });
    }

    let color = mat_from_bytes(&rgb[..expected], height, width, CV_8UC3)?;
    let mut gray = Mat::default();
    imgproc::cvt_color_def(&color, &mut gray, imgproc::COLOR_RGB2GRAY)?;
    mat_to_gray(&gray)
}

/// Copy the pixels under `face` out of `gray`. The box is clipped to the frame.
pub fn crop(gray: &GrayFrame, face: &FaceBox) -> Result<GrayFrame, BufferError> {
    let x0 = face.x.min(gray.width);
    let y0 = face.y.min(gray.height);
    let x1 = face.x.saturating_add(face.width).min(gray.width);
    let y1 = face.y.saturating_add(face.height).min(gray.height);
    if x1 == x0 || y1 == y0 {
        return Ok(GrayFrame::filled(0, 0, 0));
    }

    let src = gray_to_mat(gray)?;
    let rect = Rect::new(x0 as i32, y0 as i32, (x1 - x0) as i32, (y1 - y0) as i32);
    let region = Mat::roi(&src, rect)?.try_clone()?;
    mat_to_gray(&region)
}

/// Area-averaging resize (`INTER_AREA`).
pub fn resize_area(src: &GrayFrame, dst_width: u32, dst_height: u32) -> Result<GrayFrame, BufferError> {
    if src.width == 0 || src.height == 0 {
        return Ok(GrayFrame::filled(dst_width, dst_height, 0));
    }
    let input = gray_to_mat(src)?;
    let mut output = Mat::default();
    imgproc::resize(
        &input,
        &mut output,
        Size::new(dst_width as i32, dst_height as i32),
        0.0,
        0.0,
        imgproc::INTER_AREA,
    )?;
    mat_to_gray(&output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_gray_weights() {
        // Pure red, green, blue, and a neutral gray.
        let rgb = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 77, 77, 77];
        let gray = rgb_to_gray(&rgb, 4, 1).unwrap();
        assert_eq!(gray.data, vec![76, 150, 29, 77]);
    }

    #[test]
    fn test_rgb_to_gray_short_buffer() {
        let result = rgb_to_gray(&[0u8; 5], 2, 1);
        assert!(matches!(result, Err(BufferError::InvalidLength { expected: 6, actual: 5 })));
    }

    #[test]
    fn test_mat_round_trip_keeps_layout() {
        let gray = GrayFrame::new((0..12).collect(), 4, 3).unwrap();
        let mat = gray_to_mat(&gray).unwrap();
        assert_eq!((mat.cols(), mat.rows()), (4, 3));
        assert_eq!(mat_to_gray(&mat).unwrap(), gray);
    }

    #[test]
    fn test_crop_extracts_region() {
        let data: Vec<u8> = (0..16).collect();
        let gray = GrayFrame::new(data, 4, 4).unwrap();
        let face = FaceBox { x: 1, y: 1, width: 2, height: 2 };
        let c = crop(&gray, &face).unwrap();
        assert_eq!((c.width, c.height), (2, 2));
        assert_eq!(c.data, vec![5, 6, 9, 10]);
    }

    #[test]
    fn test_crop_clips_to_frame() {
        let gray = GrayFrame::filled(10, 10, 1);
        let face = FaceBox { x: 8, y: 8, width: 5, height: 5 };
        let c = crop(&gray, &face).unwrap();
        assert_eq!((c.width, c.height), (2, 2));
    }

    #[test]
    fn test_area_resize_averages_blocks() {
        // 4x2 -> 2x1: each output pixel averages a 2x2 block.
        let src = GrayFrame::new(vec![0, 100, 200, 200, 100, 200, 0, 0], 4, 2).unwrap();
        let out = resize_area(&src, 2, 1).unwrap();
        assert_eq!(out.data, vec![100, 100]);
    }

    #[test]
    fn test_area_resize_non_integer_ratio() {
        let src = GrayFrame::filled(317, 243, 90);
        let out = resize_area(&src, 200, 200).unwrap();
        assert_eq!((out.width, out.height), (200, 200));
        assert!(out.data.iter().all(|&p| p == 90));
    }
}
