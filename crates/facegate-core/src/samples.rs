//! Enrollment patches kept on disk as `faces/<id>/<nnnn>.png`.
//!
//! The stored patches are the source of truth for [`crate::Pipeline::retrain`].

use crate::imgproc::BufferError;
use crate::types::{FaceRoi, ROI_SIZE};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SampleError {
    #[error("sample I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("sample image {path}: {source}")]
    Image {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("sample {path} is {width}x{height}, expected 200x200")]
    BadDimensions { path: String, width: u32, height: u32 },
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

pub struct SampleStore {
    root: PathBuf,
}

impl SampleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn identity_dir(&self, id: i32) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Append `rois` to identity `id`, numbering after any existing files.
    ///
    /// Either every patch is written or none is: a failure part way removes
    /// the files already written by this call.
    pub fn save(&self, id: i32, rois: &[FaceRoi]) -> Result<Vec<PathBuf>, SampleError> {
        let dir = self.identity_dir(id);
        std::fs::create_dir_all(&dir)?;
        let mut next = sample_indices(&dir)?.into_iter().max().map_or(0, |i| i + 1);

        let mut written = Vec::with_capacity(rois.len());
        for roi in rois {
            let path = dir.join(format!("{next:04}.png"));
            if let Err(e) = write_patch(&path, roi) {
                self.remove(&written);
                return Err(e);
            }
            written.push(path);
            next += 1;
        }

        tracing::debug!(id, count = written.len(), dir = %dir.display(), "stored enrollment samples");
        Ok(written)
    }

    /// Delete sample files returned by [`SampleStore::save`], then any
    /// identity directory left empty.
    pub fn remove(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove sample");
                }
            }
        }
        let dirs: std::collections::BTreeSet<&Path> = paths.iter().filter_map(|p| p.parent()).collect();
        for dir in dirs {
            // Only succeeds when empty.
            let _ = std::fs::remove_dir(dir);
        }
    }

    /// Every stored patch with its identity id, ordered by id then index.
    pub fn load_all(&self) -> Result<Vec<(FaceRoi, i32)>, SampleError> {
        let mut out = Vec::new();
        for id in self.identity_dirs()? {
            let dir = self.identity_dir(id);
            let mut indices = sample_indices(&dir)?;
            indices.sort_unstable();
            for index in indices {
                let path = dir.join(format!("{index:04}.png"));
                out.push((read_patch(&path)?, id));
            }
        }
        Ok(out)
    }

    /// Identity ids that have at least one stored patch.
    pub fn ids(&self) -> Result<Vec<i32>, SampleError> {
        let mut ids = Vec::new();
        for id in self.identity_dirs()? {
            if !sample_indices(&self.identity_dir(id))?.is_empty() {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn identity_dirs(&self) -> Result<Vec<i32>, SampleError> {
        let mut ids: Vec<i32> = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_dir())
                .filter_map(|e| e.file_name().to_str()?.parse().ok())
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        ids.sort_unstable();
        Ok(ids)
    }
}

fn sample_indices(dir: &Path) -> Result<Vec<u32>, SampleError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension()? != "png" {
                return None;
            }
            path.file_stem()?.to_str()?.parse().ok()
        })
        .collect())
}

fn write_patch(path: &Path, roi: &FaceRoi) -> Result<(), SampleError> {
    let img = image::GrayImage::from_raw(ROI_SIZE, ROI_SIZE, roi.pixels().to_vec()).ok_or(
        BufferError::InvalidLength {
            expected: (ROI_SIZE * ROI_SIZE) as usize,
            actual: roi.pixels().len(),
        },
    )?;
    img.save_with_format(path, image::ImageFormat::Png)
        .map_err(|source| SampleError::Image {
            path: path.display().to_string(),
            source,
        })
}

fn read_patch(path: &Path) -> Result<FaceRoi, SampleError> {
    let img = image::open(path)
        .map_err(|source| SampleError::Image {
            path: path.display().to_string(),
            source,
        })?
        .to_luma8();
    if img.width() != ROI_SIZE || img.height() != ROI_SIZE {
        return Err(SampleError::BadDimensions {
            path: path.display().to_string(),
            width: img.width(),
            height: img.height(),
        });
    }
    Ok(FaceRoi::from_pixels(img.into_raw())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_save_and_load_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        let rois = vec![fixtures::noise_roi(3), fixtures::gradient_roi()];

        let paths = store.save(2, &rois).unwrap();
        assert_eq!(paths[0], dir.path().join("2/0000.png"));
        assert_eq!(paths[1], dir.path().join("2/0001.png"));

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![(rois[0].clone(), 2), (rois[1].clone(), 2)]);
    }

    #[test]
    fn test_numbering_continues() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        store.save(1, &[fixtures::noise_roi(1)]).unwrap();
        let paths = store.save(1, &[fixtures::noise_roi(2)]).unwrap();
        assert_eq!(paths, vec![dir.path().join("1/0001.png")]);
    }

    #[test]
    fn test_load_orders_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        store.save(10, &[fixtures::noise_roi(1)]).unwrap();
        store.save(2, &[fixtures::noise_roi(2)]).unwrap();
        let ids: Vec<i32> = store.load_all().unwrap().into_iter().map(|(_, id)| id).collect();
        assert_eq!(ids, vec![2, 10]);
        assert_eq!(store.ids().unwrap(), vec![2, 10]);
    }

    #[test]
    fn test_remove_undoes_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        store.save(1, &[fixtures::noise_roi(1)]).unwrap();
        let paths = store.save(3, &[fixtures::noise_roi(2), fixtures::gradient_roi()]).unwrap();

        store.remove(&paths);
        assert_eq!(store.ids().unwrap(), vec![1]);
        assert!(!dir.path().join("3").exists());
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path().join("absent"));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_wrong_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("1")).unwrap();
        image::GrayImage::new(64, 64).save(dir.path().join("1/0000.png")).unwrap();
        assert!(matches!(store.load_all(), Err(SampleError::BadDimensions { .. })));
    }
}
