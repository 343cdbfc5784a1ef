//! Worker thread management
//!
//! Workers are OS threads that run a scheduler loop. The pool reports each
//! worker's kernel thread id before `start` returns so callers can pin
//! tasks to a specific worker right away.

use crate::tls;
use fiberio_core::{kdebug, kerror, SchedResult, WorkerError};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Pool of worker threads
pub struct WorkerPool {
    /// Join handles for worker threads
    handles: Vec<JoinHandle<()>>,

    /// Kernel thread id of worker `i` at index `i`
    thread_ids: Vec<i32>,
}

impl WorkerPool {
    /// Spawn `count` threads named `{name}-worker-{i}`, each running `worker_fn(i)`
    ///
    /// Blocks until every worker has reported its thread id.
    pub fn start<F>(count: usize, name: &str, worker_fn: F) -> SchedResult<WorkerPool>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let worker_fn = Arc::new(worker_fn);
        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::with_capacity(count);

        for i in 0..count {
            let worker_fn = Arc::clone(&worker_fn);
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", name, i))
                .spawn(move || {
                    let _ = tx.send((i, tls::thread_id()));
                    drop(tx);
                    worker_fn(i);
                })
                .map_err(|e| {
                    kerror!("failed to spawn {}-worker-{}: {}", name, i, e);
                    WorkerError::SpawnFailed
                })?;
            handles.push(handle);
        }
        drop(tx);

        let mut thread_ids = vec![0; count];
        for _ in 0..count {
            let (i, tid) = rx.recv().map_err(|_| WorkerError::StartupFailed)?;
            thread_ids[i] = tid;
        }
        kdebug!("{}: {} workers up {:?}", name, count, thread_ids);

        Ok(WorkerPool { handles, thread_ids })
    }

    #[inline]
    pub fn thread_ids(&self) -> &[i32] {
        &self.thread_ids
    }

    #[inline]
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Wait for all workers to finish
    pub fn join(self) -> SchedResult<()> {
        let mut result = Ok(());
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                kerror!("{} panicked", name);
                result = Err(WorkerError::Panicked.into());
            }
        }
        result
    }
}
