//! Identity table persisted as `labels.json` (`{ "<id>": "<name>" }`).
//!
//! Unlike the threshold, a malformed table is an error: there is no safe
//! default for who is enrolled.

use crate::layout::write_atomic;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Identity id (as a decimal string) to display name.
pub type LabelMap = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum LabelError {
    #[error("label table I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("label table {path} is malformed: {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

pub struct LabelStore {
    path: PathBuf,
}

impl LabelStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored table, empty if the file does not exist yet.
    pub fn load(&self) -> Result<LabelMap, LabelError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LabelMap::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|source| LabelError::Malformed {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub fn save(&self, labels: &LabelMap) -> Result<(), LabelError> {
        let mut body = serde_json::to_vec_pretty(labels).map_err(|source| LabelError::Malformed {
            path: self.path.display().to_string(),
            source,
        })?;
        body.push(b'\n');
        write_atomic(&self.path, &body)?;
        tracing::debug!(path = %self.path.display(), identities = labels.len(), "label table saved");
        Ok(())
    }
}

/// Id already assigned to `name`, if any.
pub fn id_for(labels: &LabelMap, name: &str) -> Option<i32> {
    labels
        .iter()
        .filter(|(_, n)| n.as_str() == name)
        .find_map(|(id, _)| id.parse().ok())
}

/// One past the largest id in use, starting at 1.
///
/// `reserved` holds ids claimed outside the table (stored samples, model
/// labels) so that a fresh identity never inherits leftovers.
pub fn next_id(labels: &LabelMap, reserved: &BTreeSet<i32>) -> i32 {
    numeric_ids(labels)
        .into_iter()
        .chain(reserved.iter().copied())
        .max()
        .map_or(1, |max| max.max(0) + 1)
}

pub fn name_of(labels: &LabelMap, id: i32) -> Option<&str> {
    labels.get(&id.to_string()).map(String::as_str)
}

/// Keys that parse as identity ids; anything else is ignored.
pub fn numeric_ids(labels: &LabelMap) -> BTreeSet<i32> {
    labels.keys().filter_map(|k| k.parse().ok()).collect()
}
