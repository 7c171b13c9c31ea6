use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Fixed-length face descriptor. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaceEncoding(Vec<f32>);

impl FaceEncoding {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    /// Euclidean distance. Encodings of different dimensionality are infinitely far apart.
    pub fn distance(&self, other: &FaceEncoding) -> f32 {
        if self.0.len() != other.0.len() {
            return f32::INFINITY;
        }
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl From<Vec<f32>> for FaceEncoding {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// One known-person observation in the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub name: String,
    pub encoding: FaceEncoding,
}

/// Faces found in one frame; `boxes[i]` produced `encodings[i]`.
#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    pub boxes: Vec<BoundingBox>,
    pub encodings: Vec<FaceEncoding>,
}

impl DetectionResult {
    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty()
    }
}

/// Result of matching a probe encoding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Name at the nearest gallery entry, set only when matched.
    pub name: Option<String>,
    /// Distance to the nearest gallery entry (infinite for an empty gallery).
    pub distance: f32,
}

/// Strategy for comparing a probe encoding against gallery entries.
pub trait Matcher {
    fn compare(&self, probe: &FaceEncoding, gallery: &[GalleryEntry], tolerance: f32) -> MatchResult;
}

/// Nearest-neighbour matcher over Euclidean distance.
///
/// A match is declared when the nearest distance is strictly below the
/// tolerance. Equal distances resolve to the earliest gallery entry.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &FaceEncoding, gallery: &[GalleryEntry], tolerance: f32) -> MatchResult {
        let nearest = gallery
            .iter()
            .enumerate()
            .map(|(i, entry)| (i, probe.distance(&entry.encoding)))
            .fold(None::<(usize, f32)>, |best, (i, d)| match best {
                Some((_, best_d)) if best_d <= d => best,
                _ => Some((i, d)),
            });

        match nearest {
            Some((idx, distance)) if distance < tolerance => MatchResult {
                matched: true,
                name: Some(gallery[idx].name.clone()),
                distance,
            },
            Some((_, distance)) => MatchResult {
                matched: false,
                name: None,
                distance,
            },
            None => MatchResult {
                matched: false,
                name: None,
                distance: f32::INFINITY,
            },
        }
    }
}

/// Final result of one detection cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    NoPerson,
    Known { names: BTreeSet<String> },
    Unknown { cluster_count: usize },
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::NoPerson => "no_person",
            Outcome::Known { .. } => "known_person",
            Outcome::Unknown { .. } => "unknown_person",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry {
            name: name.into(),
            encoding: FaceEncoding::new(values),
        }
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = FaceEncoding::new(vec![0.1, 0.2, 0.3]);
        assert_eq!(a.distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_distance_pythagorean() {
        let a = FaceEncoding::new(vec![0.0, 0.0]);
        let b = FaceEncoding::new(vec![3.0, 4.0]);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_dimension_mismatch() {
        let a = FaceEncoding::new(vec![0.0, 0.0]);
        let b = FaceEncoding::new(vec![0.0, 0.0, 0.0]);
        assert!(a.distance(&b).is_infinite());
    }

    #[test]
    fn test_matcher_picks_nearest() {
        let probe = FaceEncoding::new(vec![1.0, 0.0]);
        let gallery = vec![
            entry("far", vec![0.0, 1.0]),
            entry("near", vec![0.9, 0.0]),
        ];
        let result = EuclideanMatcher.compare(&probe, &gallery, 0.5);
        assert!(result.matched);
        assert_eq!(result.name.as_deref(), Some("near"));
        assert!((result.distance - 0.1).abs() < 1e-5);
    }

    #[test]
    fn test_matcher_tie_goes_to_first_entry() {
        let probe = FaceEncoding::new(vec![0.0, 0.0]);
        let gallery = vec![
            entry("first", vec![0.3, 0.0]),
            entry("second", vec![0.0, 0.3]),
            entry("third", vec![-0.3, 0.0]),
        ];
        let result = EuclideanMatcher.compare(&probe, &gallery, 0.5);
        assert_eq!(result.name.as_deref(), Some("first"));
    }

    #[test]
    fn test_matcher_threshold_is_strict() {
        let probe = FaceEncoding::new(vec![0.0]);
        let gallery = vec![entry("edge", vec![0.5])];
        let result = EuclideanMatcher.compare(&probe, &gallery, 0.5);
        assert!(!result.matched);
        assert_eq!(result.name, None);
        assert!((result.distance - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_matcher_empty_gallery() {
        let probe = FaceEncoding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher.compare(&probe, &[], 0.5);
        assert!(!result.matched);
        assert!(result.distance.is_infinite());
    }

    #[test]
    fn test_match_set_monotonic_in_tolerance() {
        let gallery: Vec<GalleryEntry> = (0..6)
            .map(|i| entry(&format!("p{i}"), vec![i as f32 * 0.25, 0.1 * i as f32]))
            .collect();
        let probes: Vec<FaceEncoding> = (0..20)
            .map(|i| FaceEncoding::new(vec![i as f32 * 0.09, 0.05 * (i % 4) as f32]))
            .collect();
        let tolerances = [0.0, 0.05, 0.1, 0.2, 0.35, 0.5, 0.8, 1.5];

        for pair in tolerances.windows(2) {
            let (t1, t2) = (pair[0], pair[1]);
            for probe in &probes {
                let strict = EuclideanMatcher.compare(probe, &gallery, t1);
                let loose = EuclideanMatcher.compare(probe, &gallery, t2);
                if strict.matched {
                    assert!(loose.matched, "t1={t1} matched but t2={t2} did not");
                    assert_eq!(strict.name, loose.name);
                }
            }
        }
    }

    #[test]
    fn test_encoding_serializes_as_plain_array() {
        let enc = FaceEncoding::new(vec![0.5, -1.0]);
        assert_eq!(serde_json::to_string(&enc).unwrap(), "[0.5,-1.0]");
    }

    #[test]
    fn test_outcome_kind() {
        assert_eq!(Outcome::NoPerson.kind(), "no_person");
        assert_eq!(Outcome::Unknown { cluster_count: 2 }.kind(), "unknown_person");
    }
}
