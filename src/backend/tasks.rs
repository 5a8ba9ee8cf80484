//! Named registry of background tasks.
//!
//! Every public backend operation runs as a spawned task registered under
//! a name, so `close()` can abort whatever is still in flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};

use crate::{lock_ignore_poison, BackendError, Result};

#[derive(Default)]
pub(crate) struct BackendTasks {
    tasks: Mutex<HashMap<u64, (String, AbortHandle)>>,
    next: AtomicU64,
}

impl BackendTasks {
    /// Spawn `fut` under `name`.
    pub(crate) fn spawn<F>(&self, name: &str, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        // ---
        let handle = tokio::spawn(fut);
        let id = self.next.fetch_add(1, Ordering::Relaxed);

        let mut tasks = lock_ignore_poison(&self.tasks);
        tasks.retain(|_, (_, h)| !h.is_finished());
        tasks.insert(id, (name.to_string(), handle.abort_handle()));
        handle
    }

    /// Spawn `fut` under `name` and wait for it.
    ///
    /// # Errors
    ///
    /// The task's own error, or [`BackendError::ConnectionClosed`] when the
    /// task was cancelled.
    pub(crate) async fn run<F, T>(&self, name: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        // ---
        match self.spawn(name, fut).await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => {
                Err(BackendError::ConnectionClosed(format!("{name} cancelled")))
            }
            Err(err) => Err(BackendError::Transport(format!("{name} panicked: {err}"))),
        }
    }

    /// Abort every running task registered under `name`.
    #[cfg(test)]
    pub(crate) fn cancel(&self, name: &str) {
        // ---
        let mut tasks = lock_ignore_poison(&self.tasks);
        tasks.retain(|_, (n, h)| {
            if n == name {
                h.abort();
                false
            } else {
                !h.is_finished()
            }
        });
    }

    pub(crate) fn cancel_all(&self) {
        for (_, (_, handle)) in lock_ignore_poison(&self.tasks).drain() {
            handle.abort();
        }
    }

    /// Running tasks registered under `name`.
    #[cfg(test)]
    pub(crate) fn running(&self, name: &str) -> usize {
        lock_ignore_poison(&self.tasks)
            .values()
            .filter(|(n, h)| n == name && !h.is_finished())
            .count()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_task_result() {
        // ---
        let tasks = BackendTasks::default();
        let value = tasks.run("add", async { Ok(2 + 2) }).await.unwrap();
        assert_eq!(value, 4);
    }

    #[tokio::test]
    async fn test_cancel_by_name() {
        // ---
        let tasks = BackendTasks::default();
        let slow = tasks.spawn("slow", tokio::time::sleep(Duration::from_secs(60)));
        let other = tasks.spawn("other", tokio::time::sleep(Duration::from_secs(60)));
        assert_eq!(tasks.running("slow"), 1);

        tasks.cancel("slow");
        assert!(slow.await.unwrap_err().is_cancelled());
        assert_eq!(tasks.running("other"), 1);

        tasks.cancel_all();
        assert!(other.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_run_is_connection_closed() {
        // ---
        let tasks = std::sync::Arc::new(BackendTasks::default());
        let runner = {
            let tasks = tasks.clone();
            tokio::spawn(async move {
                tasks
                    .run("stuck", async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        tasks.cancel("stuck");

        let result = runner.await.unwrap();
        assert!(matches!(result, Err(BackendError::ConnectionClosed(_))));
    }
}
