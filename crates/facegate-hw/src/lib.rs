//! facegate-hw: V4L2 camera capture.
//!
//! Opens capture devices, converts their native formats to RGB24 and
//! skips frames too dark to be useful.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::CameraSource;
