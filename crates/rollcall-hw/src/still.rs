//! Still-image capture source backed by a file on disk.

use crate::camera::CameraError;
use crate::frame::Frame;
use crate::CaptureSource;
use std::path::{Path, PathBuf};

/// Serves the same decoded image for every capture.
pub struct StillImage {
    path: PathBuf,
    frame: Frame,
    sequence: u32,
}

impl StillImage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        let path = path.as_ref().to_path_buf();
        let image = image::open(&path)
            .map_err(|e| CameraError::ImageUnreadable {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
            .to_rgb8();

        tracing::info!(
            path = %path.display(),
            width = image.width(),
            height = image.height(),
            "using still image as capture source"
        );

        Ok(Self {
            path,
            frame: Frame {
                width: image.width(),
                height: image.height(),
                data: image.into_raw(),
                timestamp: std::time::Instant::now(),
                sequence: 0,
            },
            sequence: 0,
        })
    }
}

impl CaptureSource for StillImage {
    fn capture_still(&mut self) -> Result<Frame, CameraError> {
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Frame {
            timestamp: std::time::Instant::now(),
            sequence: self.sequence,
            ..self.frame.clone()
        })
    }

    fn describe(&self) -> String {
        format!(
            "still image {} ({}x{})",
            self.path.display(),
            self.frame.width,
            self.frame.height
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_still_image_source() {
        let path = std::env::temp_dir().join(format!("rollcall-still-{}.png", std::process::id()));
        RgbImage::from_pixel(3, 2, Rgb([10, 20, 30]))
            .save(&path)
            .unwrap();

        let mut source = StillImage::open(&path).unwrap();
        let first = source.capture_still().unwrap();
        let second = source.capture_still().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!((first.width, first.height), (3, 2));
        assert_eq!(&first.data[..3], &[10, 20, 30]);
        assert_eq!(second.sequence, first.sequence + 1);
        assert!(source.describe().contains("3x2"));
    }

    #[test]
    fn test_still_image_missing_file() {
        let err = StillImage::open("/nonexistent/face.png").err().unwrap();
        assert!(matches!(err, CameraError::ImageUnreadable { .. }));
    }
}
