//! doorwatch-media — Frame acquisition from network cameras and clip recording.
//!
//! Two interchangeable acquisition strategies share the [`FrameSource`]
//! contract: a continuous decoder connection read in a loop, and an external
//! capture tool that writes numbered frames to disk.
//!
//! Feature `rtsp-ffmpeg` decodes the continuous stream in-process with libav.

pub mod capture_tool;
pub mod clip;
pub mod frame;
pub mod source;
pub mod spawn;
pub mod stream;
#[cfg(feature = "rtsp-ffmpeg")]
pub mod stream_libav;

pub use capture_tool::ExternalCaptureSource;
pub use clip::{ClipArtifact, ClipError, ClipRecorder};
pub use frame::{Frame, FrameBatch};
pub use source::{CaptureError, CaptureStrategy, CaptureWindow, FrameSource, SourceOptions};
pub use spawn::{BackgroundSpawner, BackgroundTask};
pub use stream::{ContinuousReadSource, FfmpegStreamConnector, FrameReader, StreamConnector};
#[cfg(feature = "rtsp-ffmpeg")]
pub use stream_libav::LibavStreamConnector;
