//! Inbox task queue
//!
//! Admitted activities are handed to a bounded channel and applied by a
//! pool of async workers, so the HTTP response never waits on storage or
//! remote fetches.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use super::activity::InboxActivity;
use super::processor::InboxProcessor;
use crate::config::FederationConfig;
use crate::error::AppError;
use crate::metrics::INBOX_QUEUE_DEPTH;

/// One admitted activity waiting to be applied
#[derive(Debug, Clone)]
pub struct InboxTask {
    pub activity: InboxActivity,
    /// Local actor whose inbox received it; `None` for the shared inbox
    pub recipient_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboxTask {
    pub fn new(activity: InboxActivity, recipient_id: Option<String>) -> Self {
        Self {
            activity,
            recipient_id,
            received_at: Utc::now(),
        }
    }

    /// Milliseconds since the inbox admitted this task
    pub fn waited_ms(&self) -> i64 {
        (Utc::now() - self.received_at).num_milliseconds().max(0)
    }
}

/// Destination for admitted activities
pub trait TaskQueue: Send + Sync {
    /// Enqueue without waiting
    ///
    /// # Errors
    /// `QueueUnavailable` when the queue is full or shut down
    fn enqueue(&self, task: InboxTask) -> Result<(), AppError>;
}

/// Bounded channel feeding a `WorkerPool`
#[derive(Clone)]
pub struct ChannelQueue {
    sender: mpsc::Sender<InboxTask>,
}

impl TaskQueue for ChannelQueue {
    fn enqueue(&self, task: InboxTask) -> Result<(), AppError> {
        match self.sender.try_send(task) {
            Ok(()) => {
                INBOX_QUEUE_DEPTH.inc();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                tracing::warn!(activity = task.activity.kind(), "Inbox queue full");
                Err(AppError::QueueUnavailable)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::error!("Inbox queue closed");
                Err(AppError::QueueUnavailable)
            }
        }
    }
}

/// Workers applying queued activities
pub struct WorkerPool {
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Start the dispatcher and return the queue that feeds it
    ///
    /// At most `config.workers` tasks run at once. The pool stops once every
    /// clone of the returned queue has been dropped.
    pub fn spawn(processor: Arc<InboxProcessor>, config: &FederationConfig) -> (ChannelQueue, Self) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let workers = config.workers;
        let handle = tokio::spawn(dispatch(processor, receiver, workers));

        tracing::info!(
            workers,
            capacity = config.queue_capacity,
            "Inbox worker pool started"
        );

        (ChannelQueue { sender }, Self { handle })
    }

    /// Wait until queued and in-flight tasks have finished
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Inbox dispatcher panicked");
        }
    }
}

async fn dispatch(
    processor: Arc<InboxProcessor>,
    mut receiver: mpsc::Receiver<InboxTask>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));

    while let Some(task) = receiver.recv().await {
        INBOX_QUEUE_DEPTH.dec();
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };

        let processor = processor.clone();
        tokio::spawn(async move {
            processor.process(task).await;
            drop(permit);
        });
    }

    // Drain: every permit back means every task is done.
    let _ = permits.acquire_many(workers as u32).await;
    tracing::info!("Inbox worker pool stopped");
}

/// Queue that keeps tasks in memory until drained
#[derive(Default)]
pub struct InMemoryQueue {
    tasks: Mutex<Vec<InboxTask>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every queued task, oldest first
    pub fn drain(&self) -> Vec<InboxTask> {
        self.tasks
            .lock()
            .map(|mut tasks| std::mem::take(&mut *tasks))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskQueue for InMemoryQueue {
    fn enqueue(&self, task: InboxTask) -> Result<(), AppError> {
        self.tasks
            .lock()
            .map_err(|_| AppError::QueueUnavailable)?
            .push(task);
        Ok(())
    }
}
