//! doorwatch-core — Face detection, recognition and the per-cycle decision.
//!
//! Uses SCRFD for face detection and ArcFace for face encodings, both
//! running via ONNX Runtime on the CPU. Encodings are matched against a
//! JSON-backed gallery and aggregated across a frame batch into one outcome.

pub mod alignment;
pub mod analyzer;
pub mod cluster;
pub mod config;
pub mod decision;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use analyzer::{AnalyzeError, FaceAnalyzer, OnnxFaceAnalyzer};
pub use config::{Config, ConfigError, Paths};
pub use decision::{
    compose_label, Decision, DecisionConfig, DecisionEngine, DetailedLabel, LabelError, ScanCache, ScanMode, ScanState,
};
pub use gallery::{AddReport, FaceGallery, GalleryError, GalleryLock, GalleryStats};
pub use matcher::FaceMatcher;
pub use types::{BoundingBox, DetectionResult, FaceEncoding, GalleryEntry, MatchResult, Outcome};
