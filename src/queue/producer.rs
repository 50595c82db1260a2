//! Queue producer: serializes tasks and enforces queue capacity.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::QueueError;
use crate::queue::store::TaskQueue;
use crate::queue::task::Task;

/// Upper bound on any single store call made by the producer.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Appends tasks to a [`TaskQueue`], rejecting instead of blocking.
///
/// A rejection is `QueueError::Full` (backpressure) or
/// `QueueError::Unavailable` (the store could not be reached in time).
#[derive(Clone)]
pub struct QueueProducer {
    queue: Arc<dyn TaskQueue>,
    capacity: usize,
    store_timeout: Duration,
}

impl QueueProducer {
    pub fn new(queue: Arc<dyn TaskQueue>, capacity: usize) -> Self {
        Self {
            queue,
            capacity,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Append `task` at the tail, or say why not.
    pub async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let length = self.bounded(self.queue.length()).await?;
        if length >= self.capacity {
            warn!(
                queue = self.queue.name(),
                length,
                capacity = self.capacity,
                task_id = %task.task_id,
                "Queue full, rejecting task"
            );
            return Err(QueueError::Full {
                queue: self.queue.name().to_string(),
                length,
                capacity: self.capacity,
            });
        }

        let record = task.encode()?;
        let stored = self.bounded(self.queue.append(record)).await?;
        if !stored {
            return Err(self.unavailable("append was not acknowledged".into()));
        }

        debug!(
            queue = self.queue.name(),
            task_id = %task.task_id,
            filename = %task.attachment_filename,
            "Task enqueued"
        );
        Ok(())
    }

    /// Run a store call under the producer's timeout, mapping every store
    /// failure to `Unavailable`.
    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, QueueError>>,
    ) -> Result<T, QueueError> {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(QueueError::Unavailable { queue, reason })) => {
                Err(QueueError::Unavailable { queue, reason })
            }
            Ok(Err(e)) => Err(self.unavailable(e.to_string())),
            Err(_) => Err(self.unavailable(format!(
                "no response within {:?}",
                self.store_timeout
            ))),
        }
    }

    fn unavailable(&self, reason: String) -> QueueError {
        QueueError::Unavailable {
            queue: self.queue.name().to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::ingest::model::{AttachmentCandidate, SenderIdentity, SourceItem};
    use crate::queue::store::MemoryTaskQueue;

    fn task(n: usize) -> Task {
        let item = SourceItem::new(format!("m{n}"), "s", SenderIdentity::default());
        let att = AttachmentCandidate::new(format!("a{n}"), "f.pdf", "", vec![1]);
        Task::from_attachment(&item, &att)
    }

    #[tokio::test]
    async fn capacity_two_rejects_third_until_pop() {
        let queue = Arc::new(MemoryTaskQueue::new("q"));
        let producer = QueueProducer::new(queue.clone(), 2);

        assert!(producer.enqueue(&task(1)).await.is_ok());
        assert!(producer.enqueue(&task(2)).await.is_ok());
        let err = producer.enqueue(&task(3)).await.unwrap_err();
        assert!(err.is_full());

        queue.pop_head(Duration::from_millis(10)).await.unwrap();
        assert!(producer.enqueue(&task(3)).await.is_ok());
        assert_eq!(queue.length().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn offline_store_rejects_unavailable() {
        let queue = Arc::new(MemoryTaskQueue::new("q"));
        queue.set_available(false);
        let producer = QueueProducer::new(queue, 10);
        assert!(matches!(
            producer.enqueue(&task(1)).await,
            Err(QueueError::Unavailable { .. })
        ));
    }

    /// A store that never answers.
    struct HangingQueue;

    #[async_trait]
    impl TaskQueue for HangingQueue {
        fn name(&self) -> &str {
            "hanging"
        }
        async fn append(&self, _record: String) -> Result<bool, QueueError> {
            std::future::pending().await
        }
        async fn pop_head(&self, _timeout: Duration) -> Result<Option<String>, QueueError> {
            std::future::pending().await
        }
        async fn length(&self) -> Result<usize, QueueError> {
            std::future::pending().await
        }
        async fn peek(&self, _count: usize) -> Result<Vec<String>, QueueError> {
            Ok(Vec::new())
        }
        async fn clear(&self) -> Result<usize, QueueError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn hanging_store_fails_fast() {
        let producer = QueueProducer::new(Arc::new(HangingQueue), 10)
            .with_store_timeout(Duration::from_millis(20));
        let started = std::time::Instant::now();
        let err = producer.enqueue(&task(1)).await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
