//! Small fixed-size thread pool for calls into slow external collaborators.
//!
//! Workers submit a closure and get back a [`TaskHandle`] they can poll
//! without blocking ([`TaskHandle::try_take`]) or wait on with a ceiling
//! ([`TaskHandle::wait_timeout`]). Panics inside a task are caught and
//! reported through the handle instead of tearing down the pool thread.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Why a submitted task produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task panicked; carries the panic message when it was a string.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The pool dropped the task before it ran (shutdown).
    #[error("task abandoned before completion")]
    Abandoned,
}

/// Non-blocking view of a task's progress.
#[derive(Debug)]
pub enum TaskPoll<T> {
    Ready(Result<T, TaskError>),
    Pending,
}

/// Handle to one submitted task. Dropping it discards the eventual result.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    /// Check for completion without blocking.
    pub fn try_take(&self) -> TaskPoll<T> {
        match self.rx.try_recv() {
            Ok(result) => TaskPoll::Ready(result),
            Err(TryRecvError::Empty) => TaskPoll::Pending,
            Err(TryRecvError::Disconnected) => TaskPoll::Ready(Err(TaskError::Abandoned)),
        }
    }

    /// Wait at most `timeout` for completion.
    pub fn wait_timeout(&self, timeout: Duration) -> TaskPoll<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => TaskPoll::Ready(result),
            Err(RecvTimeoutError::Timeout) => TaskPoll::Pending,
            Err(RecvTimeoutError::Disconnected) => TaskPoll::Ready(Err(TaskError::Abandoned)),
        }
    }
}

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("executor is shut down")]
    ShutDown,
    #[error("executor queue is full")]
    Saturated,
}

/// Fixed-size pool of named threads.
pub struct BoundedExecutor {
    name: String,
    size: usize,
    job_tx: Option<Sender<Job>>,
    active: Arc<AtomicUsize>,
}

impl std::fmt::Debug for BoundedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedExecutor")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("active", &self.active_tasks())
            .finish()
    }
}

impl BoundedExecutor {
    /// Start `size` threads named `{name}-{i}`.
    ///
    /// At most `size` tasks run at once; up to `size` more may wait in the
    /// queue before [`SubmitError::Saturated`] is returned.
    ///
    /// # Errors
    ///
    /// Returns an error if a pool thread cannot be spawned.
    pub fn new(name: impl Into<String>, size: usize) -> crate::error::Result<Self> {
        let name = name.into();
        let size = size.max(1);
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(size);
        let active = Arc::new(AtomicUsize::new(0));

        for i in 0..size {
            let job_rx = job_rx.clone();
            let active = Arc::clone(&active);
            std::thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        active.fetch_add(1, Ordering::SeqCst);
                        job();
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                })
                .map_err(|e| {
                    crate::error::CompanionError::Executor(format!(
                        "failed to spawn {name} thread: {e}"
                    ))
                })?;
        }
        debug!(executor = %name, size, "bounded executor started");

        Ok(Self {
            name,
            size,
            job_tx: Some(job_tx),
            active,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently running on a pool thread.
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.job_tx.is_none()
    }

    /// Submit a task.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::ShutDown`] after [`shutdown`](Self::shutdown)
    /// and [`SubmitError::Saturated`] when the queue is full.
    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>, SubmitError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let Some(job_tx) = &self.job_tx else {
            return Err(SubmitError::ShutDown);
        };
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let executor = self.name.clone();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(task)).map_err(|payload| {
                let message = panic_message(payload.as_ref());
                error!(executor = %executor, "task panicked: {message}");
                TaskError::Panicked(message)
            });
            // The handle may have been dropped; the result is then discarded.
            let _ = result_tx.send(result);
        });
        match job_tx.try_send(job) {
            Ok(()) => Ok(TaskHandle { rx: result_rx }),
            Err(TrySendError::Full(_)) => Err(SubmitError::Saturated),
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShutDown),
        }
    }

    /// Stop accepting work. Running tasks finish on their own; pool threads
    /// exit once the queue drains.
    pub fn shutdown(&mut self) {
        if self.job_tx.take().is_some() {
            debug!(executor = %self.name, "bounded executor shutting down");
        }
    }
}

impl Drop for BoundedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
