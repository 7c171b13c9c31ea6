//! Batch-level decision: who, if anyone, is at the door.
//!
//! The fast pass scans frames in order and stops at the first frame with a
//! gallery match. The detailed pass, run afterwards for known outcomes,
//! looks at every face in the batch and builds a human-readable label.

use crate::analyzer::FaceAnalyzer;
use crate::cluster::{dbscan, DEFAULT_CLUSTER_EPSILON};
use crate::gallery::FaceGallery;
use crate::matcher::FaceMatcher;
use crate::types::{DetectionResult, FaceEncoding, Outcome};
use doorwatch_media::FrameBatch;
use serde::Deserialize;
use std::collections::BTreeSet;
use thiserror::Error;

/// Which frames of a batch are analysed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[default]
    AllFrames,
    /// Only the middle frame; cheaper, misses people who walk past quickly.
    MiddleFrame,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionConfig {
    pub cluster_epsilon: f32,
    pub scan_mode: ScanMode,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            cluster_epsilon: DEFAULT_CLUSTER_EPSILON,
            scan_mode: ScanMode::AllFrames,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Scanning,
    NoFaceEver,
    KnownFastPath,
    UnknownPending,
}

/// Detection results from the fast pass, indexed by frame position.
#[derive(Debug, Clone, Default)]
pub struct ScanCache {
    results: Vec<Option<DetectionResult>>,
}

impl ScanCache {
    fn with_len(len: usize) -> Self {
        Self {
            results: vec![None; len],
        }
    }

    pub fn get(&self, index: usize) -> Option<&DetectionResult> {
        self.results.get(index).and_then(Option::as_ref)
    }

    pub fn scanned(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    fn insert(&mut self, index: usize, result: DetectionResult) {
        if index >= self.results.len() {
            self.results.resize(index + 1, None);
        }
        self.results[index] = Some(result);
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub outcome: Outcome,
    pub state: ScanState,
    pub frames_scanned: usize,
    /// Frame whose match produced a known outcome.
    pub matched_frame: Option<usize>,
    /// First frame with any detection, for unknown outcomes.
    pub representative_frame: Option<usize>,
    pub cache: ScanCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailedLabel {
    pub names: BTreeSet<String>,
    pub unknown_clusters: usize,
    pub text: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LabelError {
    #[error("no face encodings in batch")]
    NoEncodings,
    #[error("label would be empty")]
    EmptyLabel,
}

pub struct DecisionEngine {
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    fn scan_order(&self, batch: &FrameBatch) -> Vec<usize> {
        match self.config.scan_mode {
            ScanMode::AllFrames => (0..batch.len()).collect(),
            ScanMode::MiddleFrame => vec![batch.middle_index()],
        }
    }

    /// Scan frames in order until one contains a gallery match.
    pub fn fast_pass<A: FaceAnalyzer>(
        &self,
        matcher: &mut FaceMatcher<A>,
        batch: &FrameBatch,
        gallery: &FaceGallery,
    ) -> Decision {
        let mut cache = ScanCache::with_len(batch.len());
        let mut state = ScanState::Scanning;
        let mut frames_scanned = 0;
        let mut representative_frame = None;
        let mut matched: Option<(usize, BTreeSet<String>)> = None;

        for index in self.scan_order(batch) {
            let frame = &batch.frames()[index];
            let result = matcher.detect(frame);
            frames_scanned += 1;

            if !result.is_empty() && representative_frame.is_none() {
                representative_frame = Some(index);
            }
            let names: BTreeSet<String> = result
                .encodings
                .iter()
                .filter_map(|enc| matcher.match_encoding(enc, gallery).name)
                .collect();
            tracing::debug!(frame = index, faces = result.encodings.len(), matches = names.len(), "frame scanned");
            cache.insert(index, result);

            if !names.is_empty() {
                state = ScanState::KnownFastPath;
                matched = Some((index, names));
                break;
            }
        }

        let (outcome, matched_frame) = match matched {
            Some((index, names)) => (Outcome::Known { names }, Some(index)),
            None if representative_frame.is_none() => {
                state = ScanState::NoFaceEver;
                (Outcome::NoPerson, None)
            }
            None => {
                state = ScanState::UnknownPending;
                let encodings = collect_encodings(&cache);
                let cluster_count = dbscan(&encodings, self.config.cluster_epsilon, 1).len();
                (Outcome::Unknown { cluster_count }, None)
            }
        };

        tracing::info!(
            outcome = outcome.kind(),
            ?state,
            frames_scanned,
            batch = batch.len(),
            "fast pass finished"
        );

        Decision {
            outcome,
            state,
            frames_scanned,
            matched_frame,
            representative_frame,
            cache,
        }
    }

    /// Label every person in the batch, reusing detections cached by the fast pass.
    pub fn detailed_label<A: FaceAnalyzer>(
        &self,
        matcher: &mut FaceMatcher<A>,
        batch: &FrameBatch,
        gallery: &FaceGallery,
        mut cache: ScanCache,
    ) -> Result<DetailedLabel, LabelError> {
        let reused = cache.scanned();
        for index in self.scan_order(batch) {
            if cache.get(index).is_none() {
                let result = matcher.detect(&batch.frames()[index]);
                cache.insert(index, result);
            }
        }

        let encodings = collect_encodings(&cache);
        if encodings.is_empty() {
            return Err(LabelError::NoEncodings);
        }

        let clusters = dbscan(&encodings, self.config.cluster_epsilon, 1);
        let mut names = BTreeSet::new();
        let mut unknown_clusters = 0;
        for cluster in &clusters {
            let matched: Vec<String> = cluster
                .iter()
                .filter_map(|&i| matcher.match_encoding(&encodings[i], gallery).name)
                .collect();
            if matched.is_empty() {
                unknown_clusters += 1;
            } else {
                names.extend(matched);
            }
        }

        let text = compose_label(&names, unknown_clusters).ok_or(LabelError::EmptyLabel)?;
        tracing::info!(
            encodings = encodings.len(),
            reused_frames = reused,
            clusters = clusters.len(),
            label = %text,
            "detailed label built"
        );
        Ok(DetailedLabel {
            names,
            unknown_clusters,
            text,
        })
    }
}

fn collect_encodings(cache: &ScanCache) -> Vec<FaceEncoding> {
    cache
        .results
        .iter()
        .flatten()
        .flat_map(|r| r.encodings.iter().cloned())
        .collect()
}

/// `"A"`, `"A and B"`, `"A, B and C"`, followed by `" and N unknown person(s)"`.
pub fn compose_label(names: &BTreeSet<String>, unknown: usize) -> Option<String> {
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let known = match names.as_slice() {
        [] => None,
        [only] => Some(only.to_string()),
        [init @ .., last] => Some(format!("{} and {last}", init.join(", "))),
    };
    let unknown = match unknown {
        0 => None,
        1 => Some("1 unknown person".to_string()),
        n => Some(format!("{n} unknown persons")),
    };

    match (known, unknown) {
        (Some(k), Some(u)) => Some(format!("{k} and {u}")),
        (Some(k), None) => Some(k),
        (None, Some(u)) => Some(u),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::testing::{frame, ScriptedAnalyzer};
    use crate::matcher::DEFAULT_TOLERANCE;
    use crate::types::GalleryEntry;
    use std::sync::atomic::Ordering;

    fn batch(len: u64) -> FrameBatch {
        FrameBatch::new((0..len).map(frame).collect()).unwrap()
    }

    fn gallery() -> FaceGallery {
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
        .unwrap()
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    const ALICE: [f32; 3] = [0.95, 0.05, 0.0];
    const BOB: [f32; 3] = [0.0, 0.97, 0.05];
    const STRANGER: [f32; 3] = [0.0, 0.0, 5.0];

    #[test]
    fn test_fast_pass_stops_at_first_match() {
        let mut script = vec![Ok(vec![]), Ok(vec![STRANGER.to_vec()]), Ok(vec![]), Ok(vec![ALICE.to_vec()])];
        script.extend((0..6).map(|_| Ok(vec![BOB.to_vec()])));
        let analyzer = ScriptedAnalyzer::new(script);
        let calls = analyzer.calls.clone();
        let mut matcher = FaceMatcher::new(analyzer, DEFAULT_TOLERANCE);

        let engine = DecisionEngine::new(DecisionConfig::default());
        let decision = engine.fast_pass(&mut matcher, &batch(10), &gallery());

        assert_eq!(decision.outcome, Outcome::Known { names: set(&["Alice"]) });
        assert_eq!(decision.state, ScanState::KnownFastPath);
        assert_eq!(decision.matched_frame, Some(3));
        assert_eq!(decision.frames_scanned, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_fast_pass_known_names_deduplicated() {
        let analyzer = ScriptedAnalyzer::faces(vec![vec![ALICE.to_vec(), BOB.to_vec(), ALICE.to_vec()]]);
        let mut matcher = FaceMatcher::new(analyzer, DEFAULT_TOLERANCE);
        let decision = DecisionEngine::new(DecisionConfig::default()).fast_pass(&mut matcher, &batch(3), &gallery());
        assert_eq!(decision.outcome, Outcome::Known { names: set(&["Alice", "Bob"]) });
    }

    #[test]
    fn test_fast_pass_no_faces_is_no_person() {
        let analyzer = ScriptedAnalyzer::faces(vec![]);
        let calls = analyzer.calls.clone();
        let mut matcher = FaceMatcher::new(analyzer, DEFAULT_TOLERANCE);
        let decision = DecisionEngine::new(DecisionConfig::default()).fast_pass(&mut matcher, &batch(5), &gallery());

        assert_eq!(decision.outcome, Outcome::NoPerson);
        assert_eq!(decision.state, ScanState::NoFaceEver);
        assert_eq!(decision.representative_frame, None);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_fast_pass_analyzer_errors_are_no_person() {
        let analyzer = ScriptedAnalyzer::new(vec![Err(()), Err(())]);
        let mut matcher = FaceMatcher::new(analyzer, DEFAULT_TOLERANCE);
        let decision = DecisionEngine::new(DecisionConfig::default()).fast_pass(&mut matcher, &batch(2), &gallery());
        assert_eq!(decision.outcome, Outcome::NoPerson);
    }

    #[test]
    fn test_fast_pass_unknown_clusters_strangers() {
        let analyzer = ScriptedAnalyzer::faces(vec![
            vec![],
            vec![vec![0.0, 0.0, 5.0]],
            vec![vec![0.1, 0.0, 5.0]],
            vec![vec![0.0, 0.2, 5.1], vec![4.0, 4.0, 0.0]],
        ]);
        let mut matcher = FaceMatcher::new(analyzer, DEFAULT_TOLERANCE);
        let decision = DecisionEngine::new(DecisionConfig::default()).fast_pass(&mut matcher, &batch(4), &gallery());

        assert_eq!(decision.outcome, Outcome::Unknown { cluster_count: 2 });
        assert_eq!(decision.state, ScanState::UnknownPending);
        assert_eq!(decision.representative_frame, Some(1));
    }

    #[test]
    fn test_three_close_strangers_are_one_unknown() {
        let analyzer = ScriptedAnalyzer::faces(vec![
            vec![vec![0.0, 0.0, 5.0]],
            vec![vec![0.2, 0.0, 5.0]],
            vec![vec![0.0, 0.3, 5.0]],
        ]);
        let mut matcher = FaceMatcher::new(analyzer, DEFAULT_TOLERANCE);
        let decision = DecisionEngine::new(DecisionConfig::default()).fast_pass(&mut matcher, &batch(3), &gallery());
        assert_eq!(decision.outcome, Outcome::Unknown { cluster_count: 1 });
    }

    #[test]
    fn test_middle_frame_mode_scans_one_frame() {
        let analyzer = ScriptedAnalyzer::faces(vec![
            vec![ALICE.to_vec()],
            vec![ALICE.to_vec()],
            vec![STRANGER.to_vec()],
            vec![ALICE.to_vec()],
        ]);
        let calls = analyzer.calls.clone();
        let mut matcher = FaceMatcher::new(analyzer, DEFAULT_TOLERANCE);
        let engine = DecisionEngine::new(DecisionConfig {
            scan_mode: ScanMode::MiddleFrame,
            ..DecisionConfig::default()
        });
        let decision = engine.fast_pass(&mut matcher, &batch(4), &gallery());

        assert_eq!(decision.outcome, Outcome::Unknown { cluster_count: 1 });
        assert_eq!(decision.representative_frame, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detailed_label_known_and_unknown() {
        let analyzer = ScriptedAnalyzer::faces(vec![
            vec![ALICE.to_vec()],
            vec![ALICE.to_vec(), BOB.to_vec()],
            vec![STRANGER.to_vec()],
            vec![vec![0.1, 0.0, 5.0]],
        ]);
        let mut matcher = FaceMatcher::new(analyzer, DEFAULT_TOLERANCE);
        let engine = DecisionEngine::new(DecisionConfig::default());
        let frames = batch(4);
        let decision = engine.fast_pass(&mut matcher, &frames, &gallery());
        assert_eq!(decision.matched_frame, Some(0));

        let label = engine
            .detailed_label(&mut matcher, &frames, &gallery(), decision.cache)
            .unwrap();
        assert_eq!(label.names, set(&["Alice", "Bob"]));
        assert_eq!(label.unknown_clusters, 1);
        assert_eq!(label.text, "Alice and Bob and 1 unknown person");
    }

    #[test]
    fn test_detailed_label_reuses_cache() {
        let analyzer = ScriptedAnalyzer::faces(vec![vec![], vec![ALICE.to_vec()], vec![BOB.to_vec()]]);
        let calls = analyzer.calls.clone();
        let mut matcher = FaceMatcher::new(analyzer, DEFAULT_TOLERANCE);
        let engine = DecisionEngine::new(DecisionConfig::default());
        let frames = batch(3);

        let decision = engine.fast_pass(&mut matcher, &frames, &gallery());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let label = engine
            .detailed_label(&mut matcher, &frames, &gallery(), decision.cache)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(label.text, "Alice and Bob");
    }

    #[test]
    fn test_detailed_label_without_faces() {
        let mut matcher = FaceMatcher::new(ScriptedAnalyzer::faces(vec![]), DEFAULT_TOLERANCE);
        let engine = DecisionEngine::new(DecisionConfig::default());
        let err = engine
            .detailed_label(&mut matcher, &batch(2), &gallery(), ScanCache::default())
            .unwrap_err();
        assert_eq!(err, LabelError::NoEncodings);
    }

    #[test]
    fn test_compose_label_forms() {
        assert_eq!(compose_label(&set(&["A"]), 0).as_deref(), Some("A"));
        assert_eq!(compose_label(&set(&["B", "A"]), 0).as_deref(), Some("A and B"));
        assert_eq!(compose_label(&set(&["C", "A", "B"]), 0).as_deref(), Some("A, B and C"));
        assert_eq!(compose_label(&set(&[]), 1).as_deref(), Some("1 unknown person"));
        assert_eq!(compose_label(&set(&[]), 3).as_deref(), Some("3 unknown persons"));
        assert_eq!(
            compose_label(&set(&["A", "B", "C"]), 2).as_deref(),
            Some("A, B and C and 2 unknown persons")
        );
        assert_eq!(compose_label(&set(&[]), 0), None);
    }

    #[test]
    fn test_scan_mode_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            mode: ScanMode,
        }
        let doc: Doc = toml::from_str("mode = \"middle_frame\"").unwrap();
        assert_eq!(doc.mode, ScanMode::MiddleFrame);
    }
}
