//! Worker pools for running request handlers off the progress thread.

use std::thread;

use futures::executor::ThreadPool;

use crate::error::{Error, Result};

/// A job handed to a worker pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// An executor request handlers can be dispatched to.
///
/// A context configured with a pool submits every inbound request to it
/// instead of running the handler on the thread calling `progress`.
pub trait WorkerPool: Send + Sync {
    /// Submit a job. On failure the job has been dropped.
    fn submit(&self, job: Job) -> Result<()>;

    /// Yield the calling execution unit once; called by `progress` after
    /// draining completions.
    fn yield_now(&self) {
        thread::yield_now();
    }
}

impl WorkerPool for ThreadPool {
    fn submit(&self, job: Job) -> Result<()> {
        self.spawn_ok(async move { job() });
        Ok(())
    }
}

/// Create a thread pool suitable for [`WorkerPool`] use.
pub fn thread_pool(size: usize) -> Result<ThreadPool> {
    ThreadPool::builder()
        .pool_size(size.max(1))
        .name_prefix("fabric-rpc-worker-")
        .create()
        .map_err(|e| {
            log::error!("failed to spawn worker pool: {}", e);
            Error::OutOfMemory
        })
}
