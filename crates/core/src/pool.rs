use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{Error, Result};

pub const DEFAULT_MAX_WORKERS: usize = 8;

/// One file to put into the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTask {
    pub source_path: PathBuf,
    pub object_key: String,
}

impl UploadTask {
    /// Progress identity of the task: its source path.
    pub fn identity(&self) -> String {
        self.source_path.display().to_string()
    }
}

#[derive(Debug, Default)]
pub struct BulkUploadResult {
    /// First failure observed by any worker. Later failures are dropped.
    pub error: Option<Error>,
    pub attempted: usize,
    pub completed: usize,
}

impl BulkUploadResult {
    pub fn into_result(self) -> Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

pub fn worker_count(max_workers: usize, tasks: usize) -> usize {
    max_workers.min(tasks)
}

/// Work queue filled once and closed before any worker starts; each task is handed
/// out exactly once.
struct WorkQueue {
    tasks: Mutex<VecDeque<UploadTask>>,
}

impl WorkQueue {
    fn closed(tasks: Vec<UploadTask>) -> Self {
        Self {
            tasks: Mutex::new(tasks.into()),
        }
    }

    fn next(&self) -> Option<UploadTask> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

struct Shared<F> {
    queue: WorkQueue,
    first_error: OnceLock<Error>,
    attempted: AtomicUsize,
    completed: AtomicUsize,
    put_one: F,
    cancel: Option<CancellationToken>,
}

impl<F> Shared<F> {
    fn record_failure(&self, worker: usize, err: Error) {
        if let Err(dropped) = self.first_error.set(err) {
            debug!(
                event = "pool.error_dropped",
                worker,
                error = %dropped,
                "pool.error_dropped"
            );
        }
    }
}

/// Uploads `tasks` with at most `max_workers` concurrent workers.
///
/// Each worker takes tasks from the shared queue until the queue is empty, a failure
/// has been recorded by any worker, or `cancel` fires. The call returns only after
/// every worker has exited, so no upload is still running once it returns.
pub async fn run_pool<F, Fut>(
    tasks: Vec<UploadTask>,
    max_workers: usize,
    cancel: Option<&CancellationToken>,
    put_one: F,
) -> BulkUploadResult
where
    F: Fn(UploadTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let total = tasks.len();
    let workers = worker_count(max_workers, total);
    if workers == 0 {
        return BulkUploadResult::default();
    }

    let started = Instant::now();
    debug!(
        event = "pool.start",
        tasks = total,
        workers,
        "pool.start"
    );

    let shared = Arc::new(Shared {
        queue: WorkQueue::closed(tasks),
        first_error: OnceLock::new(),
        attempted: AtomicUsize::new(0),
        completed: AtomicUsize::new(0),
        put_one,
        cancel: cancel.cloned(),
    });

    let mut join_set = JoinSet::new();
    for worker in 0..workers {
        let shared = shared.clone();
        join_set.spawn(async move { run_worker(worker, &shared).await });
    }

    while let Some(joined) = join_set.join_next().await {
        if let Err(e) = joined {
            error!(event = "pool.worker_lost", error = %e, "pool.worker_lost");
            let _ = shared.first_error.set(Error::Worker {
                message: e.to_string(),
            });
        }
    }

    let attempted = shared.attempted.load(Ordering::Relaxed);
    let completed = shared.completed.load(Ordering::Relaxed);
    let error = match Arc::try_unwrap(shared) {
        Ok(shared) => shared.first_error.into_inner(),
        Err(shared) => shared.first_error.get().map(|e| Error::Worker {
            message: e.to_string(),
        }),
    };

    debug!(
        event = "pool.finish",
        duration_ms = started.elapsed().as_millis() as u64,
        attempted,
        completed,
        failed = error.is_some(),
        "pool.finish"
    );

    BulkUploadResult {
        error,
        attempted,
        completed,
    }
}

async fn run_worker<F, Fut>(worker: usize, shared: &Shared<F>)
where
    F: Fn(UploadTask) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        if shared.first_error.get().is_some() {
            return;
        }
        if shared.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            shared.record_failure(worker, Error::Cancelled);
            return;
        }
        let Some(task) = shared.queue.next() else {
            return;
        };

        shared.attempted.fetch_add(1, Ordering::Relaxed);
        let key = task.object_key.clone();
        match (shared.put_one)(task).await {
            Ok(()) => {
                shared.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                error!(
                    event = "upload.put_failed",
                    worker,
                    key = %key,
                    error = %e,
                    "upload.put_failed"
                );
                shared.record_failure(worker, e);
                return;
            }
        }
    }
}
