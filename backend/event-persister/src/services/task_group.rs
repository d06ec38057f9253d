use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::{PersisterError, Result};

/// Long-running tasks that live and die together
///
/// Every task that returns bumps the shared `finished` counter. The first
/// failure cancels the shared token so the remaining tasks wind down.
pub struct TaskGroup {
    tasks: JoinSet<Result<()>>,
    cancel: CancellationToken,
    finished: Arc<AtomicUsize>,
}

impl TaskGroup {
    pub fn new(cancel: CancellationToken, finished: Arc<AtomicUsize>) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel,
            finished,
        }
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let finished = Arc::clone(&self.finished);

        self.tasks.spawn(async move {
            let result = task.await;
            finished.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = &result {
                error!(task = name, error = %e, "Task failed");
                cancel.cancel();
            }
            result
        });
    }

    /// Wait for every task; returns the first error seen
    pub async fn wait(mut self) -> Result<()> {
        let mut first_error = None;

        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                self.finished.fetch_add(1, Ordering::SeqCst);
                self.cancel.cancel();
                Err(PersisterError::Task(e.to_string()))
            });
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
