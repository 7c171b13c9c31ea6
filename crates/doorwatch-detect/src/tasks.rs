//! Task spawning for work that outlives a single await point.

use doorwatch_media::{BackgroundSpawner, BackgroundTask};
use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Spawns onto the tokio runtime the cycle runs on.
///
/// Detached tasks are abandoned when the runtime shuts down; joinable ones
/// are awaited explicitly before exit.
#[derive(Clone)]
pub struct Tasks {
    handle: Handle,
}

impl Tasks {
    /// Bind to the runtime of the calling context. Panics outside a runtime.
    pub fn current() -> Self {
        Self {
            handle: Handle::current(),
        }
    }

    pub fn spawn_joinable<T, F>(&self, name: &'static str, future: F) -> Joinable<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        tracing::debug!(task = name, "spawning joinable task");
        Joinable {
            name,
            handle: self.handle.spawn(future),
        }
    }
}

impl BackgroundSpawner for Tasks {
    fn spawn_background(&self, name: &'static str, task: BackgroundTask) {
        tracing::debug!(task = name, "spawning background task");
        drop(self.handle.spawn(task));
    }
}

/// Handle to a task whose result the caller waits for.
pub struct Joinable<T> {
    name: &'static str,
    handle: JoinHandle<T>,
}

impl<T> Joinable<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait for completion. A panicked or cancelled task yields `None`.
    pub async fn join(self) -> Option<T> {
        match self.handle.await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(task = self.name, error = %e, "task did not complete");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_joinable_returns_value() {
        let tasks = Tasks::current();
        let task = tasks.spawn_joinable("answer", async { 42 });
        assert_eq!(task.name(), "answer");
        assert_eq!(task.join().await, Some(42));
    }

    #[tokio::test]
    async fn test_joinable_panic_is_none() {
        let tasks = Tasks::current();
        let task = tasks.spawn_joinable("boom", async {
            panic!("boom");
        });
        assert_eq!(task.join().await, None::<()>);
    }

    #[tokio::test]
    async fn test_background_task_runs_detached() {
        let tasks = Tasks::current();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        tasks.spawn_background(
            "flag",
            Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
            }),
        );
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
