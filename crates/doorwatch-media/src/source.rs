//! Frame source contract shared by the acquisition strategies.

use crate::frame::{Frame, FrameBatch};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),
    #[error("no frames captured")]
    EmptyBatch,
    #[error("capture tool failed: {0}")]
    CaptureTool(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Bound on how many frames one acquisition collects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CaptureWindow {
    /// Collect for a wall-clock duration.
    Duration(Duration),
    /// Collect exactly this many frames (after warm-up).
    Count(usize),
}

/// How frames are pulled from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureStrategy {
    /// Persistent decoder connection read in a loop.
    #[default]
    Continuous,
    /// External tool writes numbered image files, loaded afterwards.
    External,
}

/// Produces one bounded, capture-ordered frame batch per call.
pub trait FrameSource {
    fn acquire(&mut self, window: CaptureWindow, fps: u32) -> Result<FrameBatch, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn acquire(&mut self, window: CaptureWindow, fps: u32) -> Result<FrameBatch, CaptureError> {
        (**self).acquire(window, fps)
    }
}

/// Options shared by every strategy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceOptions {
    /// Frames to discard before the batch proper.
    pub warmup_frames: usize,
    /// Blur each kept frame.
    pub blur: bool,
}

/// Apply per-frame preprocessing and wrap the result as a batch.
pub(crate) fn finish_batch(frames: Vec<Frame>, options: &SourceOptions) -> Result<FrameBatch, CaptureError> {
    let frames = if options.blur {
        frames.iter().map(Frame::blurred).collect()
    } else {
        frames
    };
    FrameBatch::new(frames)
}
