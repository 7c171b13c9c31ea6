//! Unknown-face clip recording.
//!
//! Frames are piped as raw RGB24 into an `ffmpeg` encoder. The newest clip is
//! published under a stable alias, and clips are deleted after a retention
//! delay by a detached background task. A detached task does not outlive the
//! process, so [`ClipRecorder::sweep_expired`] removes whatever earlier runs
//! left behind.

use crate::spawn::BackgroundSpawner;
use crate::FrameBatch;
use chrono::{DateTime, Local};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};
use thiserror::Error;

pub const LATEST_ALIAS: &str = "unknown_latest.mp4";
const CLIP_PREFIX: &str = "unknown_";
const CLIP_EXTENSION: &str = ".mp4";

#[derive(Error, Debug)]
pub enum ClipError {
    #[error("clip write failed: {0}")]
    Write(String),
    #[error("alias publish failed: {0}")]
    Alias(#[from] std::io::Error),
}

/// A video written for one unknown-face cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipArtifact {
    pub path: PathBuf,
    pub frame_count: usize,
}

/// Retry shape for polling and deletion.
#[derive(Debug, Clone, Copy)]
pub struct RetryShape {
    pub attempts: u32,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ClipRecorder {
    program: String,
    clip_dir: PathBuf,
    fps: u32,
    codec: String,
    visibility: RetryShape,
    deletion: RetryShape,
}

impl ClipRecorder {
    pub fn new(clip_dir: impl Into<PathBuf>, fps: u32, codec: impl Into<String>) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            clip_dir: clip_dir.into(),
            fps,
            codec: codec.into(),
            visibility: RetryShape {
                attempts: 5,
                interval: Duration::from_secs(1),
            },
            deletion: RetryShape {
                attempts: 3,
                interval: Duration::from_secs(5),
            },
        }
    }

    /// Use a different encoder executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_visibility_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.visibility = RetryShape { attempts, interval };
        self
    }

    pub fn with_deletion_backoff(mut self, attempts: u32, interval: Duration) -> Self {
        self.deletion = RetryShape { attempts, interval };
        self
    }

    pub fn clip_dir(&self) -> &Path {
        &self.clip_dir
    }

    /// Timestamped destination for a clip captured at `at`.
    pub fn clip_path(&self, at: DateTime<Local>) -> PathBuf {
        self.clip_dir
            .join(format!("{CLIP_PREFIX}{}{CLIP_EXTENSION}", at.format("%Y%m%d_%H%M%S")))
    }

    /// Path of the stable alias to the newest clip.
    pub fn alias_path(&self) -> PathBuf {
        self.clip_dir.join(LATEST_ALIAS)
    }

    /// Encode every frame of `batch`, in capture order, into `destination`.
    pub fn record(&self, batch: &FrameBatch, destination: &Path) -> Result<ClipArtifact, ClipError> {
        let (width, height) = batch.dimensions();
        if let Some(odd) = batch
            .frames()
            .iter()
            .find(|f| (f.width(), f.height()) != (width, height))
        {
            return Err(ClipError::Write(format!(
                "frame {} is {}x{}, clip is {width}x{height}",
                odd.sequence(),
                odd.width(),
                odd.height()
            )));
        }

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ClipError::Write(format!("create {}: {e}", parent.display())))?;
        }

        let mut child = Command::new(&self.program)
            .args(self.encoder_args(width, height, destination))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ClipError::Write(format!("failed to start {}: {e}", self.program)))?;

        let mut pipe_error = None;
        if let Some(mut stdin) = child.stdin.take() {
            for frame in batch.frames() {
                if let Err(e) = stdin.write_all(frame.as_rgb24()) {
                    pipe_error = Some(e);
                    break;
                }
            }
            // stdin dropped here: encoder sees EOF
        }

        let output = child
            .wait_with_output()
            .map_err(|e| ClipError::Write(format!("encoder wait failed: {e}")))?;

        if !output.status.success() || pipe_error.is_some() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().last().unwrap_or_default().to_string();
            let pipe = pipe_error.map(|e| e.to_string()).unwrap_or_default();
            return Err(ClipError::Write(format!(
                "encoder exited with {} {pipe} {detail}",
                output.status
            )));
        }

        self.wait_until_visible(destination);

        tracing::info!(
            path = %destination.display(),
            frames = batch.len(),
            fps = self.fps,
            codec = %self.codec,
            "clip written"
        );

        Ok(ClipArtifact {
            path: destination.to_path_buf(),
            frame_count: batch.len(),
        })
    }

    fn encoder_args(&self, width: u32, height: u32, destination: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{width}x{height}"),
            "-r".into(),
            self.fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-c:v".into(),
            self.codec.clone(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            destination.to_string_lossy().into_owned(),
        ]
    }

    /// Network filesystems may take a moment to expose a new file.
    fn wait_until_visible(&self, path: &Path) {
        for attempt in 1..=self.visibility.attempts {
            if path.exists() {
                return;
            }
            tracing::debug!(attempt, path = %path.display(), "clip not visible yet");
            std::thread::sleep(self.visibility.interval);
        }
        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                attempts = self.visibility.attempts,
                "clip still not visible after polling"
            );
        }
    }

    /// Point the stable alias at `artifact`, replacing any previous alias atomically.
    pub fn publish_latest_alias(&self, artifact: &ClipArtifact) -> Result<PathBuf, ClipError> {
        let alias = self.alias_path();
        let staging = self.clip_dir.join(format!(".{LATEST_ALIAS}.tmp"));
        match std::fs::remove_file(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        #[cfg(unix)]
        std::os::unix::fs::symlink(&artifact.path, &staging)?;
        #[cfg(not(unix))]
        std::fs::copy(&artifact.path, &staging).map(|_| ())?;

        std::fs::rename(&staging, &alias)?;
        tracing::debug!(alias = %alias.display(), target = %artifact.path.display(), "latest alias updated");
        Ok(alias)
    }

    /// Delete `artifact` after `delay` without blocking the caller.
    pub fn schedule_deletion(&self, artifact: &ClipArtifact, delay: Duration, spawner: &dyn BackgroundSpawner) {
        tracing::info!(
            path = %artifact.path.display(),
            delay_secs = delay.as_secs(),
            "clip deletion scheduled"
        );
        let task = delete_later(artifact.path.clone(), self.alias_path(), delay, self.deletion);
        spawner.spawn_background("clip-deletion", Box::pin(task));
    }

    /// Delete every clip in the clip directory older than `retention`.
    ///
    /// Returns how many clips were removed. Blocks for the deletion backoff
    /// when a removal fails.
    pub fn sweep_expired(&self, retention: Duration) -> usize {
        let entries = match std::fs::read_dir(&self.clip_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!(dir = %self.clip_dir.display(), error = %e, "cannot list clips");
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !is_clip_file(&path) {
                continue;
            }
            // DirEntry::metadata does not follow symlinks, so the alias is never a candidate.
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let expired = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age >= retention);
            if expired && remove_with_backoff(&path, self.deletion) {
                removed += 1;
            }
        }

        let alias = self.alias_path();
        let dangling = std::fs::symlink_metadata(&alias).is_ok() && std::fs::metadata(&alias).is_err();
        if dangling {
            if let Err(e) = std::fs::remove_file(&alias) {
                tracing::debug!(alias = %alias.display(), error = %e, "dangling alias removal failed");
            }
        }
        removed
    }
}

fn is_clip_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name != LATEST_ALIAS && name.starts_with(CLIP_PREFIX) && name.ends_with(CLIP_EXTENSION))
}

/// Blocking counterpart of the deferred deletion loop. `true` when this call removed the file.
fn remove_with_backoff(path: &Path, retry: RetryShape) -> bool {
    for attempt in 1..=retry.attempts {
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "expired clip deleted");
                return true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return false,
            Err(e) => {
                tracing::warn!(attempt, path = %path.display(), error = %e, "expired clip deletion failed");
                if attempt < retry.attempts {
                    std::thread::sleep(retry.interval);
                }
            }
        }
    }
    false
}

async fn delete_later(path: PathBuf, alias: PathBuf, delay: Duration, retry: RetryShape) {
    tokio::time::sleep(delay).await;

    for attempt in 1..=retry.attempts {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "clip deleted");
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "clip already gone");
                break;
            }
            Err(e) => {
                tracing::warn!(attempt, path = %path.display(), error = %e, "clip deletion failed");
                if attempt == retry.attempts {
                    tracing::warn!(path = %path.display(), "giving up on clip deletion");
                } else {
                    tokio::time::sleep(retry.interval).await;
                }
            }
        }
    }

    if tokio::fs::read_link(&alias).await.is_ok_and(|target| target == path) {
        if let Err(e) = tokio::fs::remove_file(&alias).await {
            tracing::debug!(alias = %alias.display(), error = %e, "alias removal failed");
        }
    }
}
