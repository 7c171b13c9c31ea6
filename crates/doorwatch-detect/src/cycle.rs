//! One detection cycle: acquire, decide, record, notify.

use crate::engine::{EngineError, EngineHandle};
use crate::notify::{HubEvent, NotificationSink};
use crate::tasks::{Joinable, Tasks};
use doorwatch_core::{Decision, FaceGallery, Outcome};
use doorwatch_media::{CaptureError, CaptureWindow, ClipArtifact, ClipError, ClipRecorder, FrameBatch, FrameSource};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const REASON_STREAM: &str = "camera connection failed";
const REASON_NO_FRAMES: &str = "no frames captured";
const REASON_NO_HUMAN: &str = "motion detected but no human found";

#[derive(Error, Debug)]
pub enum CycleError {
    #[error("capture failed: {0}")]
    Capture(#[source] CaptureError),
    #[error("engine: {0}")]
    Engine(#[from] EngineError),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What a finished cycle did.
pub struct CycleReport {
    pub outcome: Outcome,
    /// Why the cycle ended without a person, when it did.
    pub no_person_reason: Option<&'static str>,
    pub clip: Option<ClipArtifact>,
    /// Path handed to the hub for an unknown person.
    pub video_path: Option<PathBuf>,
    pub deletion_delay: Option<Duration>,
    pub notified: bool,
    /// Detailed label delivery; join before exiting.
    pub label_task: Option<Joinable<bool>>,
}

impl CycleReport {
    fn no_person(reason: &'static str, notified: bool) -> Self {
        Self {
            outcome: Outcome::NoPerson,
            no_person_reason: Some(reason),
            clip: None,
            video_path: None,
            deletion_delay: None,
            notified,
            label_task: None,
        }
    }
}

pub struct DetectionCycle<S, N> {
    source: S,
    window: CaptureWindow,
    fps: u32,
    engine: EngineHandle,
    gallery: Arc<FaceGallery>,
    recorder: Arc<ClipRecorder>,
    sink: Arc<N>,
    tasks: Tasks,
    retention: Duration,
}

impl<S, N> DetectionCycle<S, N>
where
    S: FrameSource + Send + 'static,
    N: NotificationSink,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: S,
        window: CaptureWindow,
        fps: u32,
        engine: EngineHandle,
        gallery: Arc<FaceGallery>,
        recorder: ClipRecorder,
        sink: Arc<N>,
        tasks: Tasks,
        retention: Duration,
    ) -> Self {
        Self {
            source,
            window,
            fps,
            engine,
            gallery,
            recorder: Arc::new(recorder),
            sink,
            tasks,
            retention,
        }
    }

    /// Run the cycle, then remove clips whose retention has elapsed.
    ///
    /// The sweep also runs when the cycle fails, since deferred deletions
    /// die with the process.
    pub async fn run(self) -> Result<CycleReport, CycleError> {
        let recorder = self.recorder.clone();
        let retention = self.retention;
        let report = self.decide_and_notify().await;

        match tokio::task::spawn_blocking(move || recorder.sweep_expired(retention)).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "expired clips removed"),
            Err(e) => tracing::warn!(error = %e, "clip sweep failed"),
        }
        report
    }

    async fn decide_and_notify(self) -> Result<CycleReport, CycleError> {
        let Self {
            mut source,
            window,
            fps,
            engine,
            gallery,
            recorder,
            sink,
            tasks,
            retention,
        } = self;

        let acquired = tokio::task::spawn_blocking(move || source.acquire(window, fps)).await?;
        let batch = match acquired {
            Ok(batch) => batch,
            Err(CaptureError::StreamUnavailable(detail)) => {
                tracing::warn!(%detail, "stream unavailable");
                return Ok(notify_no_person(&*sink, REASON_STREAM).await);
            }
            Err(CaptureError::EmptyBatch) => {
                tracing::warn!("capture produced no frames");
                return Ok(notify_no_person(&*sink, REASON_NO_FRAMES).await);
            }
            Err(e) => return Err(CycleError::Capture(e)),
        };
        tracing::info!(frames = batch.len(), gallery = gallery.len(), "batch acquired");

        let Decision {
            outcome,
            matched_frame,
            representative_frame,
            cache,
            ..
        } = engine.decide(batch.clone(), gallery.clone()).await?;
        match outcome {
            Outcome::NoPerson => Ok(notify_no_person(&*sink, REASON_NO_HUMAN).await),
            Outcome::Known { names } => {
                tracing::info!(?names, frame = ?matched_frame, "known person");
                let notified = sink.deliver(HubEvent::Known { names: names.clone() }).await;

                let label_sink = sink.clone();
                let label_task = tasks.spawn_joinable("detailed-label", async move {
                    match engine.describe(batch, gallery, cache).await {
                        Ok(label) => label_sink.deliver(HubEvent::SetText { text: label.text }).await,
                        Err(e) => {
                            tracing::warn!(error = %e, "detailed label unavailable");
                            false
                        }
                    }
                });

                Ok(CycleReport {
                    outcome: Outcome::Known { names },
                    no_person_reason: None,
                    clip: None,
                    video_path: None,
                    deletion_delay: None,
                    notified,
                    label_task: Some(label_task),
                })
            }
            Outcome::Unknown { cluster_count } => {
                tracing::info!(
                    cluster_count,
                    representative = ?representative_frame,
                    "unknown person, recording clip"
                );
                let clip = record_clip(recorder.clone(), batch).await?;

                let (clip, video_path) = match clip {
                    Ok((artifact, alias)) => {
                        let path = alias.unwrap_or_else(|| artifact.path.clone());
                        (Some(artifact), Some(path))
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "clip recording failed, notifying without video");
                        (None, None)
                    }
                };

                let notified = sink
                    .deliver(HubEvent::Unknown {
                        video_path: video_path.clone(),
                    })
                    .await;

                let deletion_delay = clip.as_ref().map(|artifact| {
                    recorder.schedule_deletion(artifact, retention, &tasks);
                    retention
                });

                Ok(CycleReport {
                    outcome: Outcome::Unknown { cluster_count },
                    no_person_reason: None,
                    clip,
                    video_path,
                    deletion_delay,
                    notified,
                    label_task: None,
                })
            }
        }
    }
}

async fn notify_no_person<N: NotificationSink>(sink: &N, reason: &'static str) -> CycleReport {
    tracing::info!(reason, "no person");
    let notified = sink
        .deliver(HubEvent::NoFace {
            reason: reason.to_string(),
        })
        .await;
    CycleReport::no_person(reason, notified)
}

/// Write the clip and publish the alias. The alias is best effort.
async fn record_clip(
    recorder: Arc<ClipRecorder>,
    batch: FrameBatch,
) -> Result<Result<(ClipArtifact, Option<PathBuf>), ClipError>, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || -> Result<_, ClipError> {
        let destination = recorder.clip_path(batch.frames()[0].captured_at());
        let artifact = recorder.record(&batch, &destination)?;
        let alias = match recorder.publish_latest_alias(&artifact) {
            Ok(alias) => Some(alias),
            Err(e) => {
                tracing::warn!(error = %e, "could not publish latest alias");
                None
            }
        };
        Ok((artifact, alias))
    })
    .await
}
