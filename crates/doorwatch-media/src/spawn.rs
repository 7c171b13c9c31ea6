//! Seam for handing work to a background executor.

use std::future::Future;
use std::pin::Pin;

pub type BackgroundTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs fire-and-forget tasks.
///
/// Implementations must not block the caller and must not keep the process
/// alive for the task: an unfinished task is abandoned at shutdown.
pub trait BackgroundSpawner {
    fn spawn_background(&self, name: &'static str, task: BackgroundTask);
}
