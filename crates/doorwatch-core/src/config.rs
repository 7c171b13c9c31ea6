//! Runtime configuration.
//!
//! Values come from an optional TOML file, then `DOORWATCH_*` environment
//! overrides. Every key has a default; only the data directory can be
//! impossible to resolve.

use crate::cluster::DEFAULT_CLUSTER_EPSILON;
use crate::decision::{DecisionConfig, ScanMode};
use crate::matcher::DEFAULT_TOLERANCE;
use doorwatch_media::{
    CaptureStrategy, CaptureWindow, ContinuousReadSource, ExternalCaptureSource, FrameSource, SourceOptions,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE_NAME: &str = "doorwatch.toml";
const APP_DIR: &str = "doorwatch";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub url: Option<String>,
    pub strategy: CaptureStrategy,
    /// Frames discarded before the batch proper.
    pub warmup_frames: usize,
    pub duration_secs: f64,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Pause between the trigger and the start of capture.
    pub trigger_delay_secs: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: None,
            strategy: CaptureStrategy::Continuous,
            warmup_frames: 15,
            duration_secs: 3.0,
            fps: 10,
            width: 640,
            height: 360,
            trigger_delay_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    pub tolerance: f32,
    pub cluster_epsilon: f32,
    pub scan_mode: ScanMode,
    pub blur: bool,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            cluster_epsilon: DEFAULT_CLUSTER_EPSILON,
            scan_mode: ScanMode::AllFrames,
            blur: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub fps: u32,
    pub codec: String,
    /// How long an unknown-person clip is kept before deletion.
    pub retention_secs: u64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: 10,
            codec: "mpeg4".to_string(),
            retention_secs: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub no_face_entity: Option<String>,
    pub known_face_entity: Option<String>,
    pub unknown_face_entity: Option<String>,
    pub label_text_entity: Option<String>,
    pub video_path_entity: Option<String>,
    pub timeout_secs: u64,
    pub attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            token: None,
            no_face_entity: None,
            known_face_entity: None,
            unknown_face_entity: None,
            label_text_entity: None,
            video_path_entity: None,
            timeout_secs: 5,
            attempts: 3,
            retry_delay_secs: 2,
        }
    }
}

impl HomeAssistantConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    stream: StreamConfig,
    recognition: RecognitionConfig,
    video: VideoConfig,
    home_assistant: HomeAssistantConfig,
}

/// Filesystem layout under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub data_dir: PathBuf,
    pub model_dir: PathBuf,
    pub gallery_store: PathBuf,
    pub known_faces_dir: PathBuf,
    pub clip_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl Paths {
    pub fn new(data_dir: PathBuf, model_dir: Option<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.unwrap_or_else(|| data_dir.join("models")),
            gallery_store: data_dir.join("encodings").join("faces.json"),
            known_faces_dir: data_dir.join("known_faces"),
            clip_dir: data_dir.join("clips"),
            scratch_dir: data_dir.join("scratch"),
            data_dir,
        }
    }

    /// SCRFD detection model.
    pub fn detector_model(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// ArcFace recognition model.
    pub fn recognizer_model(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }

    pub fn person_dir(&self, person: &str) -> PathBuf {
        self.known_faces_dir.join(person)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub paths: Paths,
    pub stream: StreamConfig,
    pub recognition: RecognitionConfig,
    pub video: VideoConfig,
    pub home_assistant: HomeAssistantConfig,
}

impl Config {
    /// Load from the process environment and the config file it points at.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let (path, explicit) = match env("DOORWATCH_CONFIG") {
            Some(p) => (Some(PathBuf::from(p)), true),
            None => (default_config_path(&env), false),
        };

        let contents = match &path {
            Some(p) => match std::fs::read_to_string(p) {
                Ok(text) => Some(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => None,
                Err(source) => {
                    return Err(ConfigError::Read {
                        path: p.clone(),
                        source,
                    })
                }
            },
            None => None,
        };

        let origin = path.as_deref().filter(|_| contents.is_some());
        let config = Self::from_sources(contents.as_deref(), origin, env)?;
        tracing::debug!(
            file = ?origin,
            data_dir = %config.paths.data_dir.display(),
            strategy = ?config.stream.strategy,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Build a configuration from file contents and an environment lookup.
    pub fn from_sources(
        file: Option<&str>,
        origin: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let parsed: FileConfig = match file {
            Some(text) => toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: origin.map(Path::to_path_buf).unwrap_or_default(),
                source,
            })?,
            None => FileConfig::default(),
        };
        let FileConfig {
            mut stream,
            mut recognition,
            video,
            mut home_assistant,
        } = parsed;

        if let Some(url) = env("DOORWATCH_RTSP_URL") {
            stream.url = Some(url);
        }
        recognition.tolerance = env_parse(&env, "DOORWATCH_TOLERANCE").unwrap_or(recognition.tolerance);
        if let Some(base) = env("DOORWATCH_HA_BASE_URL") {
            home_assistant.base_url = Some(base);
        }
        if let Some(token) = env("DOORWATCH_HA_TOKEN") {
            home_assistant.token = Some(token);
        }

        let data_dir = env("DOORWATCH_DATA_DIR")
            .map(PathBuf::from)
            .or_else(|| env("XDG_DATA_HOME").map(|d| PathBuf::from(d).join(APP_DIR)))
            .or_else(|| env("HOME").map(|h| PathBuf::from(h).join(".local/share").join(APP_DIR)))
            .ok_or(ConfigError::Missing("data directory (set DOORWATCH_DATA_DIR or HOME)"))?;
        let model_dir = env("DOORWATCH_MODEL_DIR").map(PathBuf::from);

        let config = Self {
            paths: Paths::new(data_dir, model_dir),
            stream,
            recognition,
            video,
            home_assistant,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let tolerance = self.recognition.tolerance;
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(ConfigError::Invalid(format!("recognition.tolerance must be positive, got {tolerance}")));
        }
        if !(self.recognition.cluster_epsilon.is_finite() && self.recognition.cluster_epsilon > 0.0) {
            return Err(ConfigError::Invalid("recognition.cluster_epsilon must be positive".into()));
        }
        if self.stream.fps == 0 || self.video.fps == 0 {
            return Err(ConfigError::Invalid("stream.fps and video.fps must be at least 1".into()));
        }
        if self.stream.width == 0 || self.stream.height == 0 {
            return Err(ConfigError::Invalid("stream.width and stream.height must be non-zero".into()));
        }
        let duration = self.stream.duration_secs;
        if !(duration > 0.0 && Duration::try_from_secs_f64(duration).is_ok()) {
            return Err(ConfigError::Invalid(format!("stream.duration_secs out of range: {duration}")));
        }
        let delay = self.stream.trigger_delay_secs;
        if Duration::try_from_secs_f64(delay).is_err() {
            return Err(ConfigError::Invalid(format!("stream.trigger_delay_secs out of range: {delay}")));
        }
        if self.home_assistant.attempts == 0 {
            return Err(ConfigError::Invalid("home_assistant.attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn require_stream_url(&self) -> Result<&str, ConfigError> {
        self.stream
            .url
            .as_deref()
            .ok_or(ConfigError::Missing("stream URL (set DOORWATCH_RTSP_URL or stream.url)"))
    }

    pub fn capture_window(&self) -> CaptureWindow {
        CaptureWindow::Duration(Duration::try_from_secs_f64(self.stream.duration_secs).unwrap_or_default())
    }

    pub fn trigger_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.stream.trigger_delay_secs).unwrap_or_default()
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.video.retention_secs)
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            warmup_frames: self.stream.warmup_frames,
            blur: self.recognition.blur,
        }
    }

    /// Frame source for the configured strategy. Requires a stream URL.
    ///
    /// Continuous reads decode in-process when built with `rtsp-ffmpeg`.
    pub fn frame_source(&self) -> Result<Box<dyn FrameSource + Send>, ConfigError> {
        let url = self.require_stream_url()?.to_string();
        let (width, height) = (self.stream.width, self.stream.height);
        let options = self.source_options();
        Ok(match self.stream.strategy {
            #[cfg(feature = "rtsp-ffmpeg")]
            CaptureStrategy::Continuous => Box::new(ContinuousReadSource::new(
                doorwatch_media::LibavStreamConnector::new(url, width, height),
                options,
            )),
            #[cfg(not(feature = "rtsp-ffmpeg"))]
            CaptureStrategy::Continuous => Box::new(ContinuousReadSource::new(
                doorwatch_media::FfmpegStreamConnector::new(url, width, height),
                options,
            )),
            CaptureStrategy::External => Box::new(
                ExternalCaptureSource::new(url, self.paths.scratch_dir.clone(), options).with_resolution(width, height),
            ),
        })
    }

    pub fn decision(&self) -> DecisionConfig {
        DecisionConfig {
            cluster_epsilon: self.recognition.cluster_epsilon,
            scan_mode: self.recognition.scan_mode,
        }
    }
}

fn default_config_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    env("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env("HOME").map(|h| PathBuf::from(h).join(".config")))
        .map(|base| base.join(APP_DIR).join(CONFIG_FILE_NAME))
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
