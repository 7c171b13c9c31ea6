//! Frame-level face analysis: detection plus encoding of every detected face.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{DetectionResult, FaceEncoding};
use doorwatch_media::Frame;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("analyzer returned {boxes} boxes but {encodings} encodings")]
    Misaligned { boxes: usize, encodings: usize },
}

/// Turns a frame into face boxes and encodings.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, frame: &Frame) -> Result<DetectionResult, AnalyzeError>;

    /// Encoding of the largest face in the frame, if any.
    fn encode_largest(&mut self, frame: &Frame) -> Result<Option<FaceEncoding>, AnalyzeError> {
        let result = self.analyze(frame)?;
        let largest = result
            .boxes
            .iter()
            .zip(result.encodings)
            .max_by(|(a, _), (b, _)| a.area().total_cmp(&b.area()))
            .map(|(_, encoding)| encoding);
        Ok(largest)
    }
}

impl<A: FaceAnalyzer + ?Sized> FaceAnalyzer for Box<A> {
    fn analyze(&mut self, frame: &Frame) -> Result<DetectionResult, AnalyzeError> {
        (**self).analyze(frame)
    }

    fn encode_largest(&mut self, frame: &Frame) -> Result<Option<FaceEncoding>, AnalyzeError> {
        (**self).encode_largest(frame)
    }
}

/// SCRFD detection followed by aligned ArcFace encoding.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    pub fn load(detector_model: &Path, recognizer_model: &Path) -> Result<Self, AnalyzeError> {
        Ok(Self {
            detector: FaceDetector::load(detector_model)?,
            recognizer: FaceRecognizer::load(recognizer_model)?,
        })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&mut self, frame: &Frame) -> Result<DetectionResult, AnalyzeError> {
        let detections = self.detector.detect(frame.image())?;
        let mut result = DetectionResult::default();

        for face in detections {
            if face.landmarks.is_none() {
                tracing::debug!(sequence = frame.sequence(), "skipping face without landmarks");
                continue;
            }
            let encoding = self.recognizer.encode(frame.image(), &face)?;
            result.boxes.push(face);
            result.encodings.push(encoding);
        }

        tracing::trace!(sequence = frame.sequence(), faces = result.encodings.len(), "frame analyzed");
        Ok(result)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted analyzer shared by the gallery, matcher and decision tests.

    use super::*;
    use crate::types::BoundingBox;
    use chrono::Local;
    use image::RgbImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Returns the scripted result for the frame's sequence number.
    ///
    /// Sequences past the end of the script see no faces. `Err` entries
    /// simulate analyzer failures.
    pub struct ScriptedAnalyzer {
        pub script: Vec<Result<Vec<Vec<f32>>, ()>>,
        pub calls: Arc<AtomicUsize>,
    }

    impl ScriptedAnalyzer {
        pub fn new(script: Vec<Result<Vec<Vec<f32>>, ()>>) -> Self {
            Self {
                script,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn faces(per_frame: Vec<Vec<Vec<f32>>>) -> Self {
            Self::new(per_frame.into_iter().map(Ok).collect())
        }
    }

    pub fn face_box(size: f32) -> BoundingBox {
        BoundingBox {
            x: 0.0,
            y: 0.0,
            width: size,
            height: size,
            confidence: 0.9,
            landmarks: None,
        }
    }

    impl FaceAnalyzer for ScriptedAnalyzer {
        fn analyze(&mut self, frame: &Frame) -> Result<DetectionResult, AnalyzeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.get(frame.sequence() as usize) {
                None => Ok(DetectionResult::default()),
                Some(Err(())) => Err(AnalyzeError::Recognizer(RecognizerError::NoLandmarks)),
                Some(Ok(faces)) => Ok(DetectionResult {
                    // Later faces get larger boxes.
                    boxes: (0..faces.len()).map(|i| face_box(10.0 * (i + 1) as f32)).collect(),
                    encodings: faces.iter().cloned().map(FaceEncoding::new).collect(),
                }),
            }
        }
    }

    pub fn frame(sequence: u64) -> Frame {
        Frame::new(RgbImage::new(4, 4), Local::now(), sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_encode_largest_picks_biggest_box() {
        let mut analyzer = ScriptedAnalyzer::faces(vec![vec![vec![1.0], vec![2.0], vec![3.0]]]);
        let enc = analyzer.encode_largest(&frame(0)).unwrap();
        assert_eq!(enc, Some(FaceEncoding::new(vec![3.0])));
    }

    #[test]
    fn test_encode_largest_no_faces() {
        let mut analyzer = ScriptedAnalyzer::faces(vec![vec![]]);
        assert_eq!(analyzer.encode_largest(&frame(0)).unwrap(), None);
    }

    #[test]
    fn test_boxed_analyzer_delegates() {
        let mut boxed: Box<dyn FaceAnalyzer> = Box::new(ScriptedAnalyzer::faces(vec![vec![vec![0.5, 0.5]]]));
        let result = boxed.analyze(&frame(0)).unwrap();
        assert_eq!(result.encodings.len(), 1);
    }

    #[test]
    fn test_load_missing_models() {
        let err = OnnxFaceAnalyzer::load(Path::new("/nonexistent/det.onnx"), Path::new("/nonexistent/rec.onnx")).err();
        assert!(matches!(err, Some(AnalyzeError::Detector(DetectorError::ModelNotFound(_)))));
    }
}
