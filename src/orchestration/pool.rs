//! Bounded worker pool running attempts as tokio tasks.
//!
//! The `WorkerPool` enforces the concurrency bound and the one-attempt-
//! per-task rule. Completions come back over a channel as
//! [`WorkerEvent`]s; the pool itself never touches task state.

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::{Attempt, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::executor::{AttemptExecutor, AttemptInput};
use crate::klog_error;

/// Events emitted by the pool when a worker finishes.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The attempt ran to completion. `Err` is an infrastructure failure.
    Finished {
        task: TaskId,
        result: Result<Attempt>,
    },
    /// The worker panicked mid-attempt.
    Panicked {
        task: TaskId,
        ordinal: u32,
        message: String,
    },
}

impl WorkerEvent {
    pub fn task(&self) -> &TaskId {
        match self {
            WorkerEvent::Finished { task, .. } | WorkerEvent::Panicked { task, .. } => task,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct WorkerPool {
    /// In-flight attempts indexed by task.
    active: HashMap<TaskId, JoinHandle<()>>,
    max_concurrent: usize,
    executor: Arc<AttemptExecutor>,
    event_tx: mpsc::Sender<WorkerEvent>,
}

impl WorkerPool {
    /// Create a pool running at most `max_concurrent` attempts at once.
    pub fn new(
        max_concurrent: usize,
        executor: Arc<AttemptExecutor>,
        event_tx: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            active: HashMap::new(),
            max_concurrent,
            executor,
            event_tx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.max_concurrent
    }

    pub fn is_active(&self, task: &TaskId) -> bool {
        self.active.contains_key(task)
    }

    /// Start an attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is at capacity or the task already has
    /// an attempt in flight.
    pub fn spawn(&mut self, input: AttemptInput) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_concurrent,
            });
        }
        if self.is_active(&input.task) {
            return Err(Error::TaskAlreadyRunning(input.task.clone()));
        }

        let task = input.task.clone();
        let ordinal = input.ordinal;
        let executor = Arc::clone(&self.executor);
        let tx = self.event_tx.clone();

        let handle = tokio::spawn({
            let task = task.clone();
            async move {
                let outcome = AssertUnwindSafe(executor.execute(input))
                    .catch_unwind()
                    .await;
                let event = match outcome {
                    Ok(result) => WorkerEvent::Finished { task, result },
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        klog_error!("worker for {} panicked: {}", task, message);
                        WorkerEvent::Panicked {
                            task,
                            ordinal,
                            message,
                        }
                    }
                };
                let _ = tx.send(event).await;
            }
        });

        self.active.insert(task, handle);
        Ok(())
    }

    /// Release the slot of a finished attempt.
    pub fn complete(&mut self, task: &TaskId) -> bool {
        self.active.remove(task).is_some()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("active", &self.active.len())
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}
