//! rollcall-hw — Image capture sources.
//!
//! Provides V4L2 webcam capture converted to RGB, and still-image files
//! as a stand-in source for machines without a camera.

pub mod camera;
pub mod frame;
pub mod still;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use still::StillImage;

/// Something that can produce a single still frame on demand.
pub trait CaptureSource: Send {
    fn capture_still(&mut self) -> Result<Frame, CameraError>;

    /// Human-readable description for status reporting.
    fn describe(&self) -> String;
}

/// Open a capture source: `/dev/video*` paths open a V4L2 camera, anything
/// else is read as a still image file.
pub fn open_source(device: &str) -> Result<Box<dyn CaptureSource>, CameraError> {
    if device.starts_with("/dev/video") {
        Ok(Box::new(Camera::open(device)?))
    } else {
        Ok(Box::new(StillImage::open(device)?))
    }
}
