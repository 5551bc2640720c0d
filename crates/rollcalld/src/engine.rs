use image::RgbImage;
use rollcall_hw::{CameraError, CaptureSource};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("captured frame is malformed: {0}")]
    Frame(#[from] rollcall_hw::frame::FrameError),
    #[error("failed to start capture thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("capture thread exited")]
    ChannelClosed,
    #[error("requested {requested} frames, at most {MAX_CAPTURE_FRAMES} allowed")]
    TooManyFrames { requested: usize },
}

/// Most frames a single request may ask the capture thread for.
pub const MAX_CAPTURE_FRAMES: usize = 32;

/// Messages sent from D-Bus handlers to the capture thread.
enum EngineRequest {
    Capture {
        count: usize,
        reply: oneshot::Sender<Result<Vec<RgbImage>, EngineError>>,
    },
}

/// Clone-safe handle to the capture thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    description: String,
}

impl EngineHandle {
    /// Capture `count` still frames from the camera.
    pub async fn capture(&self, count: usize) -> Result<Vec<RgbImage>, EngineError> {
        if count > MAX_CAPTURE_FRAMES {
            return Err(EngineError::TooManyFrames { requested: count });
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Capture {
                count,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Capture a single still frame.
    pub async fn capture_one(&self) -> Result<RgbImage, EngineError> {
        self.capture(1)
            .await?
            .pop()
            .ok_or(EngineError::ChannelClosed)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Spawn the capture engine on a dedicated OS thread.
///
/// Opens the capture source and discards warmup frames before entering the
/// request loop. Fails fast if the source cannot be opened.
pub fn spawn_engine(device: &str, warmup_frames: usize) -> Result<EngineHandle, EngineError> {
    let source = rollcall_hw::open_source(device)?;
    spawn_with_source(source, warmup_frames)
}

pub fn spawn_with_source(
    mut source: Box<dyn CaptureSource>,
    warmup_frames: usize,
) -> Result<EngineHandle, EngineError> {
    let description = source.describe();
    tracing::info!(source = %description, "capture source opened");

    // Discard warmup frames for camera AGC/AE stabilization
    if warmup_frames > 0 {
        tracing::info!(count = warmup_frames, "discarding warmup frames");
        for _ in 0..warmup_frames {
            if let Err(e) = source.capture_still() {
                tracing::debug!(error = %e, "warmup capture failed");
            }
        }
    }

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-capture".into())
        .spawn(move || {
            tracing::info!("capture thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Capture { count, reply } => {
                        let result = capture_frames(source.as_mut(), count);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("capture thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, description })
}

fn capture_frames(
    source: &mut dyn CaptureSource,
    count: usize,
) -> Result<Vec<RgbImage>, EngineError> {
    let mut images = Vec::with_capacity(count);
    for _ in 0..count.max(1) {
        let frame = source.capture_still()?;
        tracing::debug!(
            seq = frame.sequence,
            brightness = frame.avg_brightness(),
            "captured frame"
        );
        images.push(frame.into_rgb_image()?);
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_hw::Frame;

    struct CountingSource {
        next: u8,
    }

    impl CaptureSource for CountingSource {
        fn capture_still(&mut self) -> Result<Frame, CameraError> {
            self.next += 1;
            Ok(Frame {
                data: vec![self.next; 2 * 2 * 3],
                width: 2,
                height: 2,
                timestamp: std::time::Instant::now(),
                sequence: self.next as u32,
            })
        }

        fn describe(&self) -> String {
            "counting".into()
        }
    }

    struct BrokenSource;

    impl CaptureSource for BrokenSource {
        fn capture_still(&mut self) -> Result<Frame, CameraError> {
            Err(CameraError::AllFramesDark(5))
        }

        fn describe(&self) -> String {
            "broken".into()
        }
    }

    #[tokio::test]
    async fn test_warmup_frames_discarded() {
        let handle = spawn_with_source(Box::new(CountingSource { next: 0 }), 3).unwrap();
        let frame = handle.capture_one().await.unwrap();
        // Frames 1..=3 went to warmup
        assert_eq!(frame.get_pixel(0, 0).0, [4, 4, 4]);
        assert_eq!(handle.description(), "counting");
    }

    #[tokio::test]
    async fn test_capture_multiple() {
        let handle = spawn_with_source(Box::new(CountingSource { next: 0 }), 0).unwrap();
        let frames = handle.capture(3).await.unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].get_pixel(1, 1).0, [3, 3, 3]);
    }

    #[tokio::test]
    async fn test_capture_count_is_bounded() {
        let handle = spawn_with_source(Box::new(CountingSource { next: 0 }), 0).unwrap();
        assert!(matches!(
            handle.capture(u32::MAX as usize).await,
            Err(EngineError::TooManyFrames { .. })
        ));
        // The thread is still free to serve the next request.
        let frame = handle.capture_one().await.unwrap();
        assert_eq!(frame.get_pixel(0, 0).0, [1, 1, 1]);
    }

    #[tokio::test]
    async fn test_capture_error_propagates() {
        let handle = spawn_with_source(Box::new(BrokenSource), 2).unwrap();
        assert!(matches!(
            handle.capture_one().await,
            Err(EngineError::Camera(CameraError::AllFramesDark(5)))
        ));
    }
}
