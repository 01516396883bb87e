//! Deferred instance maintenance: a bounded queue drained by one worker.
//! The only task today is the data purge that follows an instance
//! soft-delete. A full queue blocks the producer.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::database::instances::InstanceRegistry;

/// Queue capacity.
const QUEUE_SIZE: usize = 10;

/// The purge re-runs this many times, spaced out, to sweep up rows that
/// in-flight ingestion inserts after the instance was soft-deleted.
const DELETE_RETRY_TIMES: u32 = 30;
const DELETE_RETRY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum Task {
    DeleteData { uuid: String },
}

#[derive(Clone)]
pub struct Tasker {
    queue: mpsc::Sender<Task>,
}

impl Tasker {
    pub fn start(registry: InstanceRegistry) -> Self {
        Self::with_retry(registry, DELETE_RETRY_TIMES, DELETE_RETRY_INTERVAL)
    }

    pub fn with_retry(registry: InstanceRegistry, retries: u32, interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<Task>(QUEUE_SIZE);
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                match task {
                    Task::DeleteData { uuid } => {
                        // Detached so a long purge doesn't stall the queue.
                        let registry = registry.clone();
                        tokio::spawn(async move {
                            for attempt in 1..=retries {
                                tokio::time::sleep(interval).await;
                                if let Err(err) = registry.delete_data(&uuid).await {
                                    tracing::error!(
                                        uuid = %uuid,
                                        attempt,
                                        error = %err,
                                        "failed to delete instance data"
                                    );
                                }
                            }
                        });
                    }
                }
            }
        });
        Self { queue: tx }
    }

    /// Enqueue a task; blocks while the queue is full.
    pub async fn add(&self, task: Task) {
        if self.queue.send(task).await.is_err() {
            tracing::error!("task queue worker is gone, dropping task");
        }
    }
}
