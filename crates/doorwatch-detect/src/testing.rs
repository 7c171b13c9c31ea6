//! Fakes shared by the engine and cycle tests.

use chrono::Local;
use doorwatch_core::{AnalyzeError, BoundingBox, DetectionResult, FaceAnalyzer, FaceEncoding, FaceGallery, GalleryEntry};
use doorwatch_media::{Frame, FrameBatch};
use image::{Rgb, RgbImage};

pub const ALICE: [f32; 3] = [0.97, 0.03, 0.0];
pub const STRANGER: [f32; 3] = [0.0, 0.0, 4.0];

/// Encodings keyed by frame sequence number; unknown sequences have no faces.
pub struct MapAnalyzer {
    faces: Vec<Vec<Vec<f32>>>,
}

impl MapAnalyzer {
    pub fn new(faces: Vec<Vec<Vec<f32>>>) -> Self {
        Self { faces }
    }
}

impl FaceAnalyzer for MapAnalyzer {
    fn analyze(&mut self, frame: &Frame) -> Result<DetectionResult, AnalyzeError> {
        let faces = self.faces.get(frame.sequence() as usize).cloned().unwrap_or_default();
        Ok(DetectionResult {
            boxes: faces
                .iter()
                .map(|_| BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence: 0.9,
                    landmarks: None,
                })
                .collect(),
            encodings: faces.into_iter().map(FaceEncoding::new).collect(),
        })
    }
}

/// `len` 2×2 frames whose pixels carry their sequence number.
pub fn batch(len: u64) -> FrameBatch {
    let frames = (0..len)
        .map(|i| Frame::new(RgbImage::from_pixel(2, 2, Rgb([i as u8; 3])), Local::now(), i))
        .collect();
    FrameBatch::new(frames).expect("non-empty batch")
}

pub fn gallery() -> FaceGallery {
    FaceGallery::from_entries(vec![
        GalleryEntry {
            name: "Alice".into(),
            encoding: FaceEncoding::new(vec![1.0, 0.0, 0.0]),
        },
        GalleryEntry {
            name: "Bob".into(),
            encoding: FaceEncoding::new(vec![0.0, 1.0, 0.0]),
        },
    ])
    .expect("uniform gallery")
}
