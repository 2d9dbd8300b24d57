use std::future::Future;
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Handle to work running on a pool, polled without blocking.
#[derive(Debug)]
pub(crate) struct TaskHandle<T> {
    join: JoinHandle<T>,
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Spawn on the caller's runtime, outside any pool.
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            join: tokio::spawn(fut),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.join.is_finished()
    }

    /// Resolve the task. Callers check [`Self::is_done`] first so this never waits.
    pub(crate) async fn result(self) -> Result<T, TaskError> {
        self.join.await.map_err(|err| {
            if err.is_cancelled() {
                TaskError::Cancelled
            } else {
                TaskError::Panicked(err.to_string())
            }
        })
    }

    /// Abort the task; a task still queued for a permit never starts.
    pub(crate) fn cancel(&self) {
        self.join.abort();
    }
}

/// Bounded pool shared by every job, running on its own low-priority runtime.
pub(crate) struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize, nice: i32) -> std::io::Result<Self> {
        let size = size.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(size)
            .max_blocking_threads(size)
            .thread_name("pdbsim-worker")
            .enable_all()
            .on_thread_start(move || lower_thread_priority(nice))
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
            permits: Arc::new(Semaphore::new(size)),
        })
    }

    /// Queue `fut`; it starts once a pool slot is free.
    pub(crate) fn submit<F, T>(&self, fut: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        let join = self.handle.spawn(async move {
            let _permit = permits.acquire_owned().await;
            fut.await
        });
        TaskHandle { join }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn lower_thread_priority(nice: i32) {
    if nice <= 0 {
        return;
    }
    // On Linux niceness is per thread, so this only affects pool threads.
    // SAFETY: nice(2) takes a plain integer and touches no memory we own.
    let _ = unsafe { libc::nice(nice) };
}

#[cfg(not(unix))]
fn lower_thread_priority(_nice: i32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn wait_done<T: Send + 'static>(handle: &TaskHandle<T>) {
        for _ in 0..500 {
            if handle.is_done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task did not finish");
    }

    #[tokio::test]
    async fn submitted_task_resolves() {
        let pool = WorkerPool::new(2, 0).unwrap();
        let handle = pool.submit(async { 21 * 2 });
        wait_done(&handle).await;
        assert_eq!(handle.result().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_pool_size() {
        let pool = WorkerPool::new(2, 0).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in &handles {
            wait_done(handle).await;
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_queued_task_never_runs() {
        let pool = WorkerPool::new(1, 0).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let blocker = pool.submit(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
        });
        let ran_clone = ran.clone();
        let queued = pool.submit(async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        queued.cancel();

        wait_done(&blocker).await;
        wait_done(&queued).await;
        assert!(matches!(queued.result().await, Err(TaskError::Cancelled)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
