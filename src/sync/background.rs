use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bounded pool for detached follow-up work. At most `workers` tasks run at once; the
/// rest wait for a permit.
#[derive(Clone)]
pub struct BackgroundTasks {
    permits: Arc<Semaphore>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundTasks {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            handles: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn spawn<F, T, E>(&self, name: &'static str, task: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: std::fmt::Debug + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(task = name, "Background pool closed, dropping task");
                return;
            };
            match task.await {
                Ok(out) => debug!(task = name, outcome = ?out, "Background task finished"),
                Err(e) => warn!(task = name, error = %e, "Background task failed"),
            }
        });

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Waits for every task spawned so far.
    pub async fn shutdown(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles.drain(..).collect()
        };
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task panicked");
            }
        }
    }
}
