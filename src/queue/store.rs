//! Task queue store: the shared FIFO between producer and workers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::QueueError;
use crate::queue::task::TaskRecord;

/// Durable FIFO of serialized task records.
///
/// `append` and `pop_head` are each atomic; a popped record is gone for good
/// and can never be handed to a second consumer.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue identity (the `QUEUE_NAME` setting).
    fn name(&self) -> &str;

    /// Append at the tail. Returns `true` once the record is stored.
    async fn append(&self, record: String) -> Result<bool, QueueError>;

    /// Remove and return the head, waiting up to `timeout` for one to arrive.
    async fn pop_head(&self, timeout: Duration) -> Result<Option<String>, QueueError>;

    async fn length(&self) -> Result<usize, QueueError>;

    /// Up to `count` records from the head, oldest first, without removing them.
    async fn peek(&self, count: usize) -> Result<Vec<String>, QueueError>;

    /// Drop every record. Returns how many were removed.
    async fn clear(&self) -> Result<usize, QueueError>;

    /// Oldest queued record carrying `task_id`, left in place.
    ///
    /// The default walks the whole queue; stores with an index override it.
    async fn find(&self, task_id: &str) -> Result<Option<String>, QueueError> {
        let length = self.length().await?;
        let records = self.peek(length).await?;
        Ok(records
            .into_iter()
            .find(|raw| TaskRecord::parse(raw).is_ok_and(|r| r.task_id == task_id)))
    }
}

/// In-process queue. Not durable across restarts.
pub struct MemoryTaskQueue {
    name: String,
    items: Mutex<VecDeque<String>>,
    arrivals: Notify,
    available: AtomicBool,
}

impl MemoryTaskQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
            arrivals: Notify::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable {
                queue: self.name.clone(),
                reason: "store offline".into(),
            })
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append(&self, record: String) -> Result<bool, QueueError> {
        self.check_available()?;
        self.items.lock().await.push_back(record);
        self.arrivals.notify_one();
        Ok(true)
    }

    async fn pop_head(&self, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_available()?;

            // Register interest before looking, so an append between the
            // check and the wait is not missed.
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.items.lock().await.pop_front() {
                return Ok(Some(record));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn length(&self) -> Result<usize, QueueError> {
        self.check_available()?;
        Ok(self.items.lock().await.len())
    }

    async fn peek(&self, count: usize) -> Result<Vec<String>, QueueError> {
        self.check_available()?;
        Ok(self.items.lock().await.iter().take(count).cloned().collect())
    }

    async fn clear(&self) -> Result<usize, QueueError> {
        self.check_available()?;
        let mut items = self.items.lock().await;
        let removed = items.len();
        items.clear();
        Ok(removed)
    }
}
