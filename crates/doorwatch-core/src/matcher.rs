use crate::analyzer::FaceAnalyzer;
use crate::gallery::FaceGallery;
use crate::types::{DetectionResult, EuclideanMatcher, FaceEncoding, MatchResult, Matcher};
use doorwatch_media::Frame;

pub const DEFAULT_TOLERANCE: f32 = 0.5;

/// Per-frame detection and gallery lookup.
pub struct FaceMatcher<A> {
    analyzer: A,
    tolerance: f32,
}

impl<A: FaceAnalyzer> FaceMatcher<A> {
    pub fn new(analyzer: A, tolerance: f32) -> Self {
        Self { analyzer, tolerance }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    pub fn analyzer_mut(&mut self) -> &mut A {
        &mut self.analyzer
    }

    /// Detect and encode all faces in a frame.
    ///
    /// Analyzer failures are logged and reported as an empty result so one
    /// bad frame never aborts a cycle.
    pub fn detect(&mut self, frame: &Frame) -> DetectionResult {
        match self.analyzer.analyze(frame) {
            Ok(result) if result.boxes.len() == result.encodings.len() => result,
            Ok(result) => {
                tracing::warn!(
                    sequence = frame.sequence(),
                    boxes = result.boxes.len(),
                    encodings = result.encodings.len(),
                    "analyzer returned misaligned result, treating frame as empty"
                );
                DetectionResult::default()
            }
            Err(e) => {
                tracing::warn!(sequence = frame.sequence(), error = %e, "face analysis failed, treating frame as empty");
                DetectionResult::default()
            }
        }
    }

    pub fn match_encoding(&self, encoding: &FaceEncoding, gallery: &FaceGallery) -> MatchResult {
        EuclideanMatcher.compare(encoding, gallery.entries(), self.tolerance)
    }
}
