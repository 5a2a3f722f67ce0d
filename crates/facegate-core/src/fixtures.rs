//! Synthetic inputs shared by the unit tests.

use crate::detector::FaceLocalizer;
use crate::types::{FaceRoi, ROI_SIZE};
use std::path::{Path, PathBuf};

pub const BACKGROUND: u8 = 128;
pub const FACE_DARK: u8 = 40;
pub const FACE_BRIGHT: u8 = 210;

/// One-stage 24×24 cascade whose only feature fires on a dark-over-bright square.
pub const CASCADE_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier">
  <stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>24</height>
  <width>24</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>1</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>0.</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>0 -1 0 -0.8</internalNodes>
          <leafValues>1. -1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>0 0 24 12 1.</_>
        <_>0 12 24 12 -1.</_></rects>
      <tilted>0</tilted></_></features></cascade>
</opencv_storage>
"#;

pub fn write_cascade(dir: &Path) -> PathBuf {
    let path = dir.join("cascade.xml");
    std::fs::write(&path, CASCADE_XML).unwrap();
    path
}

/// Localiser running the miniature cascade.
pub fn localizer() -> FaceLocalizer {
    let dir = tempfile::tempdir().unwrap();
    FaceLocalizer::load(&write_cascade(dir.path())).unwrap()
}

/// RGB frame filled with the background level.
pub fn blank_rgb(width: u32, height: u32) -> Vec<u8> {
    vec![BACKGROUND; (width * height * 3) as usize]
}

/// Paint a synthetic `size`×`size` face (dark upper half, bright lower half).
pub fn paint_face(rgb: &mut [u8], frame_width: u32, x: u32, y: u32, size: u32) {
    for row in y..y + size {
        let value = if row < y + size / 2 { FACE_DARK } else { FACE_BRIGHT };
        for col in x..x + size {
            let idx = ((row * frame_width + col) * 3) as usize;
            rgb[idx..idx + 3].fill(value);
        }
    }
}

/// Deterministic pseudo-random texture.
pub fn noise_roi(seed: u32) -> FaceRoi {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(0x9E37_79B9);
    let data = (0..ROI_SIZE * ROI_SIZE)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect();
    FaceRoi::from_pixels(data).unwrap()
}

/// `base` with a dark `size`×`size` blot at (`x`, `y`): the same face with a
/// small local change.
pub fn blotted(base: &FaceRoi, x: u32, y: u32, size: u32) -> FaceRoi {
    let mut data = base.pixels().to_vec();
    for row in y..y + size {
        let start = (row * ROI_SIZE + x) as usize;
        data[start..start + size as usize].fill(0);
    }
    FaceRoi::from_pixels(data).unwrap()
}

/// Smooth left-to-right ramp.
pub fn gradient_roi() -> FaceRoi {
    let data = (0..ROI_SIZE * ROI_SIZE)
        .map(|i| ((i % ROI_SIZE) * 255 / (ROI_SIZE - 1)) as u8)
        .collect();
    FaceRoi::from_pixels(data).unwrap()
}
