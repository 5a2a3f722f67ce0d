//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, DARK_FRACTION};
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera {device} unavailable: {reason}")]
    Unavailable { device: String, reason: String },
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for 640x480 YUYV; accept GREY or Y16 if the driver insists.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// Whether the device still answers capability queries.
    pub fn is_open(&self) -> bool {
        self.device.query_caps().is_ok()
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    fn stream(&self) -> Result<MmapStream<'_>, CameraError> {
        MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))
    }

    /// Capture one frame after discarding `warmup` frames (auto-exposure settling).
    pub fn capture_frame(&self, warmup: usize) -> Result<Frame, CameraError> {
        let mut stream = self.stream()?;
        for _ in 0..warmup {
            stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        }

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let rgb = self.buf_to_rgb(buf)?;
        Ok(Frame::from_rgb(rgb, self.width, self.height, meta.sequence))
    }

    /// Convert a raw buffer to RGB24 based on the negotiated format.
    fn buf_to_rgb(&self, buf: &[u8]) -> Result<Vec<u8>, CameraError> {
        let converted = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height),
            PixelFormat::Grey => {
                let pixels = (self.width * self.height) as usize;
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(frame::gray_to_rgb(&buf[..pixels]))
            }
            PixelFormat::Y16 => {
                frame::y16_to_grayscale(buf, self.width, self.height).map(|g| frame::gray_to_rgb(&g))
            }
        };
        converted.map_err(|e| CameraError::CaptureFailed(format!("{:?} conversion failed: {e}", self.pixel_format)))
    }

    /// Capture up to `count` non-dark frames.
    ///
    /// Attempts up to `count * 3` raw captures. Returns the frames and the
    /// number of dark frames skipped.
    pub fn capture_frames(&self, count: usize) -> Result<(Vec<Frame>, usize), CameraError> {
        let max_attempts = count * 3;
        let mut good_frames = Vec::with_capacity(count);
        let mut dark_count = 0usize;
        let mut stream = self.stream()?;

        for _ in 0..max_attempts {
            if good_frames.len() >= count {
                break;
            }

            let (buf, meta) = stream.next().map_err(|e| {
                CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
            })?;

            let rgb = self.buf_to_rgb(buf)?;
            let frame = Frame::from_rgb(rgb, self.width, self.height, meta.sequence);
            if frame.is_dark {
                dark_count += 1;
                tracing::debug!(seq = meta.sequence, fraction = DARK_FRACTION, "skipping dark frame");
                continue;
            }
            good_frames.push(frame);
        }

        Ok((good_frames, dark_count))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}
