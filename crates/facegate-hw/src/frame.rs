//! Frame type and pixel conversions: YUYV/GREY/Y16 to RGB24, dark detection, JPEG.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// JPEG quality used for diagnostic snapshots.
pub const SNAPSHOT_QUALITY: u8 = 80;

/// A captured camera frame as packed RGB24.
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data (width * height * 3 bytes).
    pub rgb: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Build a frame from RGB24 pixels, computing the dark flag.
    pub fn from_rgb(rgb: Vec<u8>, width: u32, height: u32, sequence: u32) -> Self {
        let is_dark = is_dark_frame(&luma(&rgb), DARK_FRACTION);
        Self {
            rgb,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        }
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let y = luma(&self.rgb);
        if y.is_empty() {
            return 0.0;
        }
        y.iter().map(|&b| b as f32).sum::<f32>() / y.len() as f32
    }

    /// Encode the frame as a baseline JPEG.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>, FrameError> {
        let expected = self.width as usize * self.height as usize * 3;
        if self.rgb.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: self.rgb.len(),
            });
        }
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100)).encode(
            &self.rgb,
            self.width,
            self.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

/// Fraction of near-black pixels above which a frame counts as dark.
pub const DARK_FRACTION: f32 = 0.95;

/// Integer BT.601 luma of packed RGB24.
fn luma(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|p| ((p[0] as u32 * 77 + p[1] as u32 * 150 + p[2] as u32 * 29 + 128) >> 8) as u8)
        .collect()
}

/// Convert packed YUYV (studio swing, BT.601) to RGB24.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected || width % 2 != 0 {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (u, v) = (chunk[1] as i32 - 128, chunk[3] as i32 - 128);
        for y in [chunk[0], chunk[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(clamp_u8((c + 409 * v + 128) >> 8));
            rgb.push(clamp_u8((c - 100 * u - 208 * v + 128) >> 8));
            rgb.push(clamp_u8((c + 516 * u + 128) >> 8));
        }
    }
    Ok(rgb)
}

/// Replicate a single channel into RGB24.
pub fn gray_to_rgb(gray: &[u8]) -> Vec<u8> {
    gray.iter().flat_map(|&g| [g, g, g]).collect()
}

/// Keep the high byte of 16-bit little-endian grayscale.
pub fn y16_to_grayscale(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    if buf.len() < pixels * 2 {
        return Err(FrameError::InvalidLength {
            expected: pixels * 2,
            actual: buf.len(),
        });
    }
    Ok(buf[..pixels * 2].chunks_exact(2).map(|px| px[1]).collect())
}

fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// True if more than `threshold_pct` of pixels fall in the darkest bucket (0–31).
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}
