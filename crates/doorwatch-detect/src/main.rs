use anyhow::{Context, Result};
use doorwatch_core::{Config, FaceGallery};
use doorwatch_media::ClipRecorder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod cycle;
mod engine;
mod notify;
mod tasks;
#[cfg(test)]
mod testing;

use cycle::DetectionCycle;
use notify::HomeAssistantSink;
use tasks::Tasks;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("doorwatch-detect starting");

    let config = Config::load().context("loading configuration")?;
    let url = config.require_stream_url()?.to_string();
    let paths = &config.paths;

    let gallery = FaceGallery::load(&paths.gallery_store).context("loading face gallery")?;
    if gallery.is_empty() {
        tracing::warn!(path = %paths.gallery_store.display(), "gallery is empty, every face will be unknown");
    }

    let engine = engine::spawn_engine(paths, config.recognition.tolerance, config.decision())?;

    let source = config.frame_source()?;
    tracing::info!(url = %url, strategy = ?config.stream.strategy, "frame source ready");

    let recorder = ClipRecorder::new(paths.clip_dir.clone(), config.video.fps, config.video.codec.clone());
    let sink = Arc::new(HomeAssistantSink::from_config(&config.home_assistant)?);

    let delay = config.trigger_delay();
    if !delay.is_zero() {
        tracing::info!(delay_ms = delay.as_millis() as u64, "waiting before capture");
        tokio::time::sleep(delay).await;
    }

    let cycle = DetectionCycle::new(
        source,
        config.capture_window(),
        config.stream.fps,
        engine,
        Arc::new(gallery),
        recorder,
        sink,
        Tasks::current(),
        config.retention(),
    );
    let report = cycle.run().await?;

    if let Some(task) = report.label_task {
        tracing::debug!(task = task.name(), "waiting for background label delivery");
        task.join().await;
    }

    tracing::info!(
        outcome = report.outcome.kind(),
        reason = report.no_person_reason.unwrap_or_default(),
        notified = report.notified,
        clip = ?report.clip.as_ref().map(|c| &c.path),
        video = ?report.video_path,
        delete_after_secs = ?report.deletion_delay.map(|d| d.as_secs()),
        "detection cycle complete"
    );
    Ok(())
}
