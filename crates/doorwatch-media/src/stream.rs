//! Continuous-read acquisition: a persistent decoder connection read in a loop.
//!
//! With the `rtsp-ffmpeg` feature the stream is decoded in-process by
//! `LibavStreamConnector`. Builds without libav fall back to
//! [`FfmpegStreamConnector`], which runs the `ffmpeg` binary and reads raw
//! RGB24 frames from its stdout.

use crate::frame::Frame;
use crate::source::{finish_batch, CaptureError, CaptureWindow, FrameSource, SourceOptions};
use crate::FrameBatch;
use chrono::Local;
use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

/// RTSP socket timeout handed to ffmpeg, in microseconds.
pub(crate) const RTSP_SOCKET_TIMEOUT_US: &str = "5000000";

/// Pause after a failed read so a flapping stream does not spin the CPU.
const READ_FAILURE_BACKOFF: Duration = Duration::from_millis(20);

/// One open stream connection.
pub trait FrameReader: Send {
    /// Read the next decoded frame.
    ///
    /// `StreamUnavailable` means the connection is gone for good; any other
    /// error is a transient read failure.
    fn read_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Opens stream connections.
pub trait StreamConnector: Send {
    fn connect(&self, fps: u32) -> Result<Box<dyn FrameReader>, CaptureError>;
}

/// Connector that decodes a network stream through an `ffmpeg` child process.
#[derive(Debug, Clone)]
pub struct FfmpegStreamConnector {
    pub program: String,
    pub url: String,
    pub width: u32,
    pub height: u32,
}

impl FfmpegStreamConnector {
    pub fn new(url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            url: url.into(),
            width,
            height,
        }
    }

    fn args(&self, fps: u32) -> Vec<String> {
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
        if is_rtsp(&self.url) {
            args.extend([
                "-rtsp_transport".into(),
                "tcp".into(),
                "-timeout".into(),
                RTSP_SOCKET_TIMEOUT_US.into(),
            ]);
        }
        args.extend(["-i".into(), self.url.clone()]);
        args.extend([
            "-an".into(),
            "-vf".into(),
            format!("fps={fps},scale={}:{}", self.width, self.height),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-f".into(),
            "rawvideo".into(),
            "pipe:1".into(),
        ]);
        args
    }
}

impl StreamConnector for FfmpegStreamConnector {
    fn connect(&self, fps: u32) -> Result<Box<dyn FrameReader>, CaptureError> {
        let mut child = Command::new(&self.program)
            .args(self.args(fps))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CaptureError::StreamUnavailable(format!("failed to start {}: {e}", self.program)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::StreamUnavailable("decoder stdout not captured".into()))?;

        tracing::info!(url = %self.url, width = self.width, height = self.height, fps, "stream decoder started");

        Ok(Box::new(PipeReader {
            child,
            stdout,
            width: self.width,
            height: self.height,
            sequence: 0,
        }))
    }
}

/// Reads fixed-size RGB24 frames from a decoder's stdout.
struct PipeReader {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    sequence: u64,
}

impl FrameReader for PipeReader {
    fn read_frame(&mut self) -> Result<Frame, CaptureError> {
        let mut buf = vec![0u8; self.width as usize * self.height as usize * 3];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(CaptureError::StreamUnavailable("decoder closed the stream".into()));
            }
            Err(e) => return Err(CaptureError::ReadFailed(e.to_string())),
        }
        let sequence = self.sequence;
        self.sequence += 1;
        Frame::from_rgb24(buf, self.width, self.height, Local::now(), sequence)
            .map_err(|e| CaptureError::ReadFailed(e.to_string()))
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub(crate) fn is_rtsp(url: &str) -> bool {
    url.starts_with("rtsp://") || url.starts_with("rtsps://")
}

/// Thins decoded frames to a target rate using their presentation times.
#[derive(Debug, Clone)]
#[cfg_attr(not(feature = "rtsp-ffmpeg"), allow(dead_code))]
pub(crate) struct FrameDecimator {
    interval: f64,
    next_due: Option<f64>,
}

#[cfg_attr(not(feature = "rtsp-ffmpeg"), allow(dead_code))]
impl FrameDecimator {
    pub(crate) fn new(fps: u32) -> Self {
        Self {
            interval: 1.0 / f64::from(fps.max(1)),
            next_due: None,
        }
    }

    /// Whether a frame presented at `at` seconds is kept. Frames without a
    /// timestamp are always kept; a jump back of more than a second resyncs.
    pub(crate) fn keep(&mut self, at: Option<f64>) -> bool {
        let Some(at) = at else { return true };
        if let Some(due) = self.next_due {
            if at < due && due - at <= 1.0 + self.interval {
                return false;
            }
        }
        self.next_due = Some(match self.next_due {
            Some(due) if at >= due && at - due < self.interval => due + self.interval,
            _ => at + self.interval,
        });
        true
    }
}

/// Copy `height` rows of packed RGB24 out of a buffer whose rows are `stride` bytes apart.
#[cfg_attr(not(feature = "rtsp-ffmpeg"), allow(dead_code))]
pub(crate) fn pack_rows(data: &[u8], stride: usize, width: u32, height: u32) -> Option<Vec<u8>> {
    let row_bytes = width as usize * 3;
    if stride == row_bytes {
        return data.get(..row_bytes * height as usize).map(<[u8]>::to_vec);
    }
    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(data.get(start..start + row_bytes)?);
    }
    Some(pixels)
}

/// Continuous-read strategy.
pub struct ContinuousReadSource<C> {
    connector: C,
    options: SourceOptions,
}

impl<C: StreamConnector> ContinuousReadSource<C> {
    pub fn new(connector: C, options: SourceOptions) -> Self {
        Self { connector, options }
    }

    /// Discard warm-up frames. Returns how many frames were read.
    fn warm_up(&self, reader: &mut dyn FrameReader) -> Result<usize, CaptureError> {
        let wanted = self.options.warmup_frames;
        let mut discarded = 0usize;
        for _ in 0..wanted * 3 {
            if discarded >= wanted {
                break;
            }
            match reader.read_frame() {
                Ok(_) => discarded += 1,
                Err(CaptureError::StreamUnavailable(reason)) => {
                    if discarded == 0 {
                        return Err(CaptureError::StreamUnavailable(reason));
                    }
                    tracing::warn!(discarded, %reason, "stream closed during warm-up");
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "warm-up read failed");
                    std::thread::sleep(READ_FAILURE_BACKOFF);
                }
            }
        }
        if discarded > 0 {
            tracing::debug!(discarded, "discarded warm-up frames");
        }
        Ok(discarded)
    }
}

impl<C: StreamConnector> FrameSource for ContinuousReadSource<C> {
    fn acquire(&mut self, window: CaptureWindow, fps: u32) -> Result<FrameBatch, CaptureError> {
        let mut reader = self.connector.connect(fps)?;
        let mut seen = self.warm_up(reader.as_mut())?;

        let started = Instant::now();
        let (deadline, target, max_attempts) = match window {
            CaptureWindow::Duration(d) => (Some(started + d), usize::MAX, usize::MAX),
            CaptureWindow::Count(n) => (None, n, n.saturating_mul(3)),
        };

        let mut frames = Vec::new();
        let mut failures = 0usize;
        let mut attempts = 0usize;

        while frames.len() < target && attempts < max_attempts {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            attempts += 1;
            match reader.read_frame() {
                Ok(frame) => {
                    seen += 1;
                    frames.push(frame);
                }
                Err(CaptureError::StreamUnavailable(reason)) => {
                    if seen == 0 {
                        return Err(CaptureError::StreamUnavailable(reason));
                    }
                    tracing::warn!(kept = frames.len(), %reason, "stream closed before the window elapsed");
                    break;
                }
                Err(e) => {
                    failures += 1;
                    tracing::trace!(error = %e, "dropping failed read");
                    std::thread::sleep(READ_FAILURE_BACKOFF);
                }
            }
        }

        tracing::info!(
            kept = frames.len(),
            failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "continuous read finished"
        );

        finish_batch(frames, &self.options)
    }
}
