use facegate_core::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Used when `FACEGATE_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/facegate/facegated.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Daemon configuration: optional TOML file, then `FACEGATE_*` overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Capture device index, opened as `/dev/video{index}`.
    pub camera_index: u32,
    /// Root of labels, models and enrollment samples.
    pub data_dir: PathBuf,
    /// Haar cascade XML used for face localisation.
    pub cascade_path: PathBuf,
    /// Face patches captured per enroll request.
    pub samples_per_enroll: usize,
    /// Frames discarded before each recognition capture (AGC/AE settling).
    pub warmup_frames: usize,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_index: 0,
            data_dir: facegate_core::default_data_dir(),
            cascade_path: PathBuf::from(facegate_core::DEFAULT_CASCADE_PATH),
            samples_per_enroll: 20,
            warmup_frames: 4,
            system_bus: false,
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the environment.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let path = lookup("FACEGATE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let mut config = Self::from_file(&path)?;
        config.apply_env(lookup);
        Ok(config)
    }

    /// Parse `path`; a missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `FACEGATE_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // CAM_INDEX is the legacy name; FACEGATE_CAMERA_INDEX wins when both are set.
        for key in ["CAM_INDEX", "FACEGATE_CAMERA_INDEX"] {
            if let Some(v) = parsed(&lookup, key) {
                self.camera_index = v;
            }
        }
        if let Some(v) = lookup("FACEGATE_DATA_DIR").filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEGATE_CASCADE_PATH").filter(|v| !v.is_empty()) {
            self.cascade_path = PathBuf::from(v);
        }
        if let Some(v) = parsed(&lookup, "FACEGATE_SAMPLES_PER_ENROLL") {
            self.samples_per_enroll = v;
        }
        if let Some(v) = parsed(&lookup, "FACEGATE_WARMUP_FRAMES") {
            self.warmup_frames = v;
        }
        if let Some(v) = lookup("FACEGATE_SYSTEM_BUS") {
            self.system_bus = v == "1";
        }
    }

    pub fn camera_device(&self) -> String {
        format!("/dev/video{}", self.camera_index)
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            data_dir: self.data_dir.clone(),
            cascade_path: self.cascade_path.clone(),
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
