//! Owned capture handle with a single reopen attempt.
//!
//! The device is opened lazily. A read that fails drops the handle so the
//! next call starts from a fresh open.

use crate::camera::{Camera, CameraError};
use crate::frame::Frame;
use std::sync::{Mutex, PoisonError};

pub struct CameraSource {
    index: u32,
    warmup_frames: usize,
    handle: Mutex<Option<Camera>>,
}

impl CameraSource {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            warmup_frames: 0,
            handle: Mutex::new(None),
        }
    }

    /// Frames discarded before each single capture.
    pub fn with_warmup(mut self, frames: usize) -> Self {
        self.warmup_frames = frames;
        self
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn device_path(&self) -> String {
        format!("/dev/video{}", self.index)
    }

    /// Make sure a live handle exists: verify the cached one, else open once.
    pub fn acquire(&self) -> Result<(), CameraError> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open(&mut handle).map(|_| ())
    }

    pub fn close(&self) {
        if self.handle.lock().unwrap_or_else(PoisonError::into_inner).take().is_some() {
            tracing::debug!(device = %self.device_path(), "camera closed");
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(Camera::is_open)
    }

    /// Ensure `handle` holds a live camera, reopening at most once.
    fn ensure_open<'a>(&self, handle: &'a mut Option<Camera>) -> Result<&'a Camera, CameraError> {
        if handle.as_ref().is_some_and(|c| !c.is_open()) {
            tracing::warn!(device = %self.device_path(), "camera stopped responding, reopening");
            *handle = None;
        }
        if handle.is_none() {
            let path = self.device_path();
            let camera = Camera::open(&path).map_err(|e| CameraError::Unavailable {
                device: path.clone(),
                reason: e.to_string(),
            })?;
            *handle = Some(camera);
        }
        handle.as_ref().ok_or_else(|| CameraError::Unavailable {
            device: self.device_path(),
            reason: "no handle after open".into(),
        })
    }

    /// Run `f` against the open camera. A failure drops the handle.
    pub fn with_camera<T>(&self, f: impl FnOnce(&Camera) -> Result<T, CameraError>) -> Result<T, CameraError> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        let camera = self.ensure_open(&mut handle)?;
        match f(camera) {
            Ok(v) => Ok(v),
            Err(e) => {
                tracing::warn!(device = %self.device_path(), error = %e, "capture failed, releasing camera");
                *handle = None;
                Err(e)
            }
        }
    }

    /// Read one frame, after the configured warm-up.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let warmup = self.warmup_frames;
        self.with_camera(|camera| camera.capture_frame(warmup))
    }

    /// Read up to `count` non-dark frames.
    pub fn capture_frames(&self, count: usize) -> Result<(Vec<Frame>, usize), CameraError> {
        self.with_camera(|camera| camera.capture_frames(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path() {
        assert_eq!(CameraSource::new(2).device_path(), "/dev/video2");
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let source = CameraSource::new(250);
        assert!(!source.is_open());
        let err = source.capture_frame().err().unwrap();
        assert!(
            matches!(err, CameraError::Unavailable { ref device, .. } if device == "/dev/video250"),
            "got {err:?}"
        );
        assert!(!source.is_open());
        assert!(matches!(source.acquire(), Err(CameraError::Unavailable { .. })));
    }
}
