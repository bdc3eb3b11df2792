//! Fixed-size worker pool for disk I/O and procedural generation.
//!
//! Workers pull boxed jobs from a shared channel. Every job runs under
//! `catch_unwind`, so a panicking task never takes a worker down; the panic is
//! delivered to whoever joins the task's [`TaskHandle`].
//!
//! A pool with zero workers runs every task inline on the submitting thread,
//! which is what single-core hosts get by default.

use std::any::Any;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use meridian_common::{StreamError, StreamResult};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Number of dispatch chunks per worker used by [`ThreadPool::parallel_for`].
const CHUNKS_PER_WORKER: usize = 4;

/// Returns the default worker count: available hardware threads minus one.
#[must_use]
pub fn default_worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(0)
}

/// Extracts a readable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handle to the result of a submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    /// Receives exactly one outcome
    receiver: Receiver<thread::Result<T>>,
    /// Outcome observed by `is_ready` but not yet joined
    outcome: Option<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Returns whether the task has finished, without blocking.
    pub fn is_ready(&mut self) -> bool {
        if self.outcome.is_none() {
            match self.receiver.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(TryRecvError::Empty) => return false,
                // Reported by `join`.
                Err(TryRecvError::Disconnected) => return true,
            }
        }
        true
    }

    /// Blocks until the task finishes and returns its value.
    ///
    /// A panic inside the task is returned as [`StreamError::WorkerPanicked`].
    pub fn join(mut self) -> StreamResult<T> {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => self
                .receiver
                .recv()
                .map_err(|_| StreamError::WorkerDisconnected)?,
        };
        outcome.map_err(|payload| StreamError::WorkerPanicked(panic_message(&*payload)))
    }
}

/// Fixed-size worker pool.
pub struct ThreadPool {
    /// Job queue; `None` for an inline (zero-worker) pool
    sender: Option<Sender<Job>>,
    /// Worker threads
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Creates a pool with `worker_count` threads. Zero means inline execution.
    #[must_use]
    pub fn new(worker_count: usize) -> Self {
        if worker_count == 0 {
            debug!("Creating inline thread pool");
            return Self {
                sender: None,
                workers: Vec::new(),
            };
        }

        let (sender, receiver) = unbounded::<Job>();
        let workers = (0..worker_count)
            .filter_map(|index| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("meridian-worker-{index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .map_err(|e| error!("Failed to spawn worker {index}: {e}"))
                    .ok()
            })
            .collect::<Vec<_>>();

        debug!("Created thread pool with {} workers", workers.len());
        if workers.is_empty() {
            return Self {
                sender: None,
                workers,
            };
        }
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Creates a pool sized to the host (hardware threads minus one).
    #[must_use]
    pub fn with_default_size() -> Self {
        Self::new(default_worker_count())
    }

    /// Returns the number of worker threads (0 for an inline pool).
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn dispatch(&self, job: Job) {
        match &self.sender {
            Some(sender) => {
                // Workers only exit once the sender is dropped, so a failed
                // send hands the job back and it runs inline.
                if let Err(rejected) = sender.send(job) {
                    (rejected.0)();
                }
            },
            None => job(),
        }
    }

    /// Submits a task and returns a handle to its result.
    pub fn submit<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        self.dispatch(Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));
            let _ = tx.send(outcome);
        }));
        TaskHandle {
            receiver: rx,
            outcome: None,
        }
    }

    /// Submits a task whose result nobody waits for. Panics are logged.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch(Box::new(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
                error!(
                    "Detached worker task panicked: {}",
                    panic_message(&*payload)
                );
            }
        }));
    }

    /// Runs `body` for every index in `range`, split into contiguous chunks
    /// across the workers, and blocks until all chunks finish.
    ///
    /// Every chunk is joined even if an earlier one failed; the first panic
    /// is then returned.
    pub fn parallel_for<F>(&self, range: Range<usize>, body: F) -> StreamResult<()>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        if range.is_empty() {
            return Ok(());
        }
        let chunk_count = (self.worker_count() * CHUNKS_PER_WORKER).max(1);
        let chunk_len = range.len().div_ceil(chunk_count);
        let body = Arc::new(body);

        let mut handles = Vec::with_capacity(chunk_count);
        let mut start = range.start;
        while start < range.end {
            let end = (start + chunk_len).min(range.end);
            let body = Arc::clone(&body);
            handles.push(self.submit(move || (start..end).for_each(|i| body(i))));
            start = end;
        }

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.join() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::with_default_size()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }
    }
}
