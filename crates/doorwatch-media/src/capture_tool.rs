//! External-capture acquisition: an external tool writes numbered frames to a
//! scratch directory, which are then loaded in filename order.

use crate::frame::Frame;
use crate::source::{finish_batch, CaptureError, CaptureWindow, FrameSource, SourceOptions};
use crate::stream::{is_rtsp, RTSP_SOCKET_TIMEOUT_US};
use crate::FrameBatch;
use chrono::{DateTime, Local};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Output file template handed to the capture tool.
const FRAME_FILE_TEMPLATE: &str = "frame_%05d.jpg";
const FRAME_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Allowance on top of the capture window for connecting and flushing.
const DEFAULT_TOOL_SLACK: Duration = Duration::from_secs(15);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// External-capture strategy backed by `ffmpeg`.
#[derive(Debug, Clone)]
pub struct ExternalCaptureSource {
    program: String,
    url: String,
    resolution: Option<(u32, u32)>,
    scratch_root: PathBuf,
    options: SourceOptions,
    slack: Duration,
}

impl ExternalCaptureSource {
    pub fn new(url: impl Into<String>, scratch_root: impl Into<PathBuf>, options: SourceOptions) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            url: url.into(),
            resolution: None,
            scratch_root: scratch_root.into(),
            options,
            slack: DEFAULT_TOOL_SLACK,
        }
    }

    /// Use a different capture executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Grace period past the capture window before the tool is killed.
    pub fn with_timeout_slack(mut self, slack: Duration) -> Self {
        self.slack = slack;
        self
    }

    /// Longest the tool may run for one acquisition.
    fn deadline(&self, window: CaptureWindow, fps: u32) -> Duration {
        let fps = f64::from(fps.max(1));
        let warmup = self.options.warmup_frames as f64 / fps;
        let window = match window {
            CaptureWindow::Duration(d) => d.as_secs_f64(),
            CaptureWindow::Count(n) => n as f64 / fps,
        };
        Duration::try_from_secs_f64(window + warmup).unwrap_or(Duration::MAX).saturating_add(self.slack)
    }

    /// Ask the tool to scale frames to this resolution.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    fn args(&self, window: CaptureWindow, fps: u32, output_dir: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
        ];
        if is_rtsp(&self.url) {
            args.extend([
                "-rtsp_transport".into(),
                "tcp".into(),
                "-timeout".into(),
                RTSP_SOCKET_TIMEOUT_US.into(),
            ]);
        }
        args.extend(["-i".into(), self.url.clone()]);

        let warmup = self.options.warmup_frames;
        match window {
            CaptureWindow::Duration(d) => {
                let warmup_secs = warmup as f64 / fps.max(1) as f64;
                args.extend(["-t".into(), format!("{:.3}", d.as_secs_f64() + warmup_secs)]);
            }
            CaptureWindow::Count(n) => {
                args.extend(["-frames:v".into(), (n + warmup).to_string()]);
            }
        }

        let filter = match self.resolution {
            Some((w, h)) => format!("fps={fps},scale={w}:{h}"),
            None => format!("fps={fps}"),
        };
        args.extend(["-vf".into(), filter, "-q:v".into(), "2".into()]);
        args.push(output_dir.join(FRAME_FILE_TEMPLATE).to_string_lossy().into_owned());
        args
    }
}

impl FrameSource for ExternalCaptureSource {
    fn acquire(&mut self, window: CaptureWindow, fps: u32) -> Result<FrameBatch, CaptureError> {
        let stamp = Local::now().format("%Y%m%d_%H%M%S_%6f");
        let output_dir = self.scratch_root.join(format!("capture-{stamp}"));
        std::fs::create_dir_all(&output_dir)?;

        let deadline = self.deadline(window, fps);
        let result = run_tool(&self.program, &self.args(window, fps, &output_dir), deadline)
            .and_then(|()| load_frames(&output_dir, self.options.warmup_frames));

        if let Err(e) = std::fs::remove_dir_all(&output_dir) {
            tracing::debug!(dir = %output_dir.display(), error = %e, "scratch cleanup failed");
        }

        let frames = result?;
        tracing::info!(kept = frames.len(), "external capture finished");
        finish_batch(frames, &self.options)
    }
}

fn run_tool(program: &str, args: &[String], deadline: Duration) -> Result<(), CaptureError> {
    tracing::debug!(program, ?args, deadline_ms = deadline.as_millis() as u64, "running capture tool");
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| CaptureError::CaptureTool(format!("failed to start {program}: {e}")))?;

    let started = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= deadline {
            if let Err(e) = child.kill() {
                tracing::debug!(error = %e, "kill of stalled capture tool failed");
            }
            child.wait()?;
            tracing::warn!(program, deadline_ms = deadline.as_millis() as u64, "capture tool stalled, killed");
            return Err(CaptureError::CaptureTool(format!(
                "{program} did not finish within {:.1}s",
                deadline.as_secs_f64()
            )));
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    };

    if !status.success() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
        return Err(CaptureError::CaptureTool(format!("{program} exited with {status}: {tail}")));
    }
    Ok(())
}

/// Load numbered frame files in filename order, skipping the first `warmup` files.
///
/// Files that fail to decode are dropped with a warning.
pub fn load_frames(dir: &Path, warmup: usize) -> Result<Vec<Frame>, CaptureError> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        })
        .collect();
    paths.sort();

    if paths.is_empty() {
        return Err(CaptureError::EmptyBatch);
    }

    let mut frames = Vec::with_capacity(paths.len().saturating_sub(warmup));
    for (sequence, path) in paths.iter().enumerate().skip(warmup) {
        let image = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping undecodable frame");
                continue;
            }
        };
        let captured_at = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(DateTime::<Local>::from)
            .unwrap_or_else(|_| Local::now());
        frames.push(Frame::new(image, captured_at, sequence as u64));
    }
    Ok(frames)
}
