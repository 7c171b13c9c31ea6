//! Frame types — decoded RGB frames and the per-cycle frame batch.

use crate::source::CaptureError;
use chrono::{DateTime, Local};
use image::RgbImage;
use std::sync::Arc;

/// Sigma matching a 3x3 Gaussian kernel.
const BLUR_SIGMA_3X3: f32 = 0.8;

/// A captured RGB frame.
///
/// Pixel data is shared behind an `Arc` so that batches can be handed to
/// the recognition engine and the clip recorder without copying. A frame is
/// never mutated after capture; [`Frame::blurred`] returns a new frame.
#[derive(Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
    captured_at: DateTime<Local>,
    sequence: u64,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at: DateTime<Local>, sequence: u64) -> Self {
        Self {
            image: Arc::new(image),
            captured_at,
            sequence,
        }
    }

    /// Build a frame from packed RGB24 bytes (width * height * 3).
    pub fn from_rgb24(
        data: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: DateTime<Local>,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let image = RgbImage::from_raw(width, height, data).ok_or(FrameError::InvalidLength {
            expected,
            actual: 0,
        })?;
        Ok(Self::new(image, captured_at, sequence))
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed RGB24 pixel data.
    pub fn as_rgb24(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> DateTime<Local> {
        self.captured_at
    }

    /// Position of this frame in its source's capture order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Slight Gaussian blur to smooth stream compression artifacts.
    pub fn blurred(&self) -> Frame {
        Frame {
            image: Arc::new(image::imageops::blur(self.image.as_ref(), BLUR_SIGMA_3X3)),
            captured_at: self.captured_at,
            sequence: self.sequence,
        }
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("captured_at", &self.captured_at)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// The ordered, non-empty set of frames captured for one detection cycle.
#[derive(Clone, Debug)]
pub struct FrameBatch {
    frames: Arc<[Frame]>,
}

impl FrameBatch {
    /// Wrap frames in capture order. Fails with `EmptyBatch` when `frames` is empty.
    pub fn new(frames: Vec<Frame>) -> Result<Self, CaptureError> {
        if frames.is_empty() {
            return Err(CaptureError::EmptyBatch);
        }
        Ok(Self {
            frames: frames.into(),
        })
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Index of the middle frame, used when a single representative frame is needed.
    pub fn middle_index(&self) -> usize {
        self.frames.len() / 2
    }

    /// Dimensions of the first frame.
    pub fn dimensions(&self) -> (u32, u32) {
        let first = &self.frames[0];
        (first.width(), first.height())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid RGB24 length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
