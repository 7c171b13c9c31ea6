use doorwatch_core::{
    AnalyzeError, Decision, DecisionConfig, DecisionEngine, DetailedLabel, FaceAnalyzer, FaceGallery, FaceMatcher,
    LabelError, OnnxFaceAnalyzer, Paths, ScanCache,
};
use doorwatch_media::FrameBatch;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model loading failed: {0}")]
    Analyzer(#[from] AnalyzeError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("label: {0}")]
    Label(#[from] LabelError),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the cycle to the engine thread.
enum EngineRequest {
    Decide {
        batch: FrameBatch,
        gallery: Arc<FaceGallery>,
        reply: oneshot::Sender<Decision>,
    },
    Describe {
        batch: FrameBatch,
        gallery: Arc<FaceGallery>,
        cache: ScanCache,
        reply: oneshot::Sender<Result<DetailedLabel, LabelError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Fast pass over the batch: stop at the first frame with a gallery match.
    pub async fn decide(&self, batch: FrameBatch, gallery: Arc<FaceGallery>) -> Result<Decision, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Decide {
                batch,
                gallery,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Detailed pass: label every person in the batch, reusing `cache`.
    pub async fn describe(
        &self,
        batch: FrameBatch,
        gallery: Arc<FaceGallery>,
        cache: ScanCache,
    ) -> Result<DetailedLabel, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Describe {
                batch,
                gallery,
                cache,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Load both ONNX models and spawn the engine on a dedicated OS thread.
///
/// Fails fast at startup if either model is unavailable.
pub fn spawn_engine(paths: &Paths, tolerance: f32, decision: DecisionConfig) -> Result<EngineHandle, EngineError> {
    let detector = paths.detector_model();
    let recognizer = paths.recognizer_model();
    let analyzer = OnnxFaceAnalyzer::load(&detector, &recognizer)?;
    tracing::info!(
        detector = %detector.display(),
        recognizer = %recognizer.display(),
        "face models loaded"
    );
    spawn_engine_with(analyzer, tolerance, decision)
}

/// Spawn the engine thread around an already constructed analyzer.
pub fn spawn_engine_with<A: FaceAnalyzer + 'static>(
    analyzer: A,
    tolerance: f32,
    decision: DecisionConfig,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let mut matcher = FaceMatcher::new(analyzer, tolerance);
    let engine = DecisionEngine::new(decision);

    std::thread::Builder::new()
        .name("doorwatch-engine".into())
        .spawn(move || {
            tracing::info!(tolerance, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Decide { batch, gallery, reply } => {
                        let decision = engine.fast_pass(&mut matcher, &batch, &gallery);
                        let _ = reply.send(decision);
                    }
                    EngineRequest::Describe {
                        batch,
                        gallery,
                        cache,
                        reply,
                    } => {
                        let label = engine.detailed_label(&mut matcher, &batch, &gallery, cache);
                        let _ = reply.send(label);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{batch, gallery, MapAnalyzer, ALICE, STRANGER};
    use doorwatch_core::Outcome;

    #[tokio::test]
    async fn test_decide_and_describe_round_trip() {
        let analyzer = MapAnalyzer::new(vec![vec![], vec![ALICE.to_vec()], vec![STRANGER.to_vec()]]);
        let engine = spawn_engine_with(analyzer, 0.5, DecisionConfig::default()).unwrap();
        let frames = batch(3);
        let gallery = Arc::new(gallery());

        let decision = engine.decide(frames.clone(), gallery.clone()).await.unwrap();
        assert!(matches!(decision.outcome, Outcome::Known { ref names } if names.contains("Alice")));
        assert_eq!(decision.matched_frame, Some(1));

        let label = engine.describe(frames, gallery, decision.cache).await.unwrap();
        assert_eq!(label.text, "Alice and 1 unknown person");
    }

    #[tokio::test]
    async fn test_describe_without_faces_is_label_error() {
        let engine = spawn_engine_with(MapAnalyzer::new(vec![]), 0.5, DecisionConfig::default()).unwrap();
        let err = engine
            .describe(batch(2), Arc::new(gallery()), ScanCache::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Label(LabelError::NoEncodings)));
    }

    #[test]
    fn test_spawn_engine_missing_models() {
        let paths = Paths::new("/nonexistent/doorwatch".into(), None);
        let err = spawn_engine(&paths, 0.5, DecisionConfig::default()).err();
        assert!(matches!(err, Some(EngineError::Analyzer(_))));
    }
}
