//! On-disk layout of the recognition data directory.
//!
//! ```text
//! <data_dir>/
//!   labels.json
//!   faces/<id>/<nnnn>.png
//!   models/lbph.bin
//!   models/model_meta.json
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.root
    }

    pub fn faces_dir(&self) -> PathBuf {
        self.root.join("faces")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.root.join("models")
    }

    pub fn labels_path(&self) -> PathBuf {
        self.root.join("labels.json")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.models_dir().join("model_meta.json")
    }

    pub fn model_path(&self) -> PathBuf {
        self.models_dir().join("lbph.bin")
    }

    /// Create the data, faces and models directories if missing.
    pub fn ensure(&self) -> io::Result<()> {
        for dir in [self.root.clone(), self.faces_dir(), self.models_dir()] {
            fs::create_dir_all(&dir)?;
        }
        tracing::debug!(root = %self.root.display(), "data layout ready");
        Ok(())
    }
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`.
///
/// The temp file is removed if any step fails.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
