//! Worker loop: dequeue, decode, dispatch, record.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::pipeline::types::{Outcome, ProcessingResult};
use crate::queue::store::TaskQueue;
use crate::queue::task::TaskRecord;
use crate::worker::dispatch::Dispatcher;
use crate::worker::state::WorkerSlot;

/// Pause after a queue store error before trying again.
const QUEUE_ERROR_PAUSE: Duration = Duration::from_millis(500);

/// Shared dependencies for every worker instance.
#[derive(Clone)]
pub struct WorkerDeps {
    pub queue: Arc<dyn TaskQueue>,
    pub dispatcher: Dispatcher,
    /// How long one dequeue waits before looping (and heartbeating) again.
    pub poll_timeout: Duration,
}

/// One worker instance bound to a pool slot.
pub struct Worker {
    slot: Arc<WorkerSlot>,
    generation: u64,
    stop: Arc<AtomicBool>,
    deps: WorkerDeps,
}

impl Worker {
    /// Create an instance for `slot`. Registers a new generation on the slot.
    pub fn new(slot: Arc<WorkerSlot>, stop: Arc<AtomicBool>, deps: WorkerDeps) -> Self {
        let generation = slot.begin_instance();
        Self {
            slot,
            generation,
            stop,
            deps,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn beat(&self) {
        self.slot.heartbeat(self.generation);
    }

    /// Run until the stop flag is observed at the top of the loop.
    ///
    /// A task already popped is always finished first; its own deadline and
    /// retry bound limit how long that takes.
    pub async fn run(self) {
        info!(
            worker_id = %self.slot.worker_id(),
            generation = self.generation,
            "Worker started"
        );

        loop {
            if self.stop.load(Ordering::SeqCst) {
                info!(worker_id = %self.slot.worker_id(), "Worker stopping");
                return;
            }
            self.beat();

            match self.deps.queue.pop_head(self.deps.poll_timeout).await {
                Ok(Some(raw)) => self.handle(raw).await,
                Ok(None) => continue,
                Err(e) => {
                    warn!(worker_id = %self.slot.worker_id(), error = %e, "Dequeue failed");
                    tokio::time::sleep(QUEUE_ERROR_PAUSE.min(self.deps.poll_timeout)).await;
                }
            }
        }
    }

    async fn handle(&self, raw: String) {
        let worker_id = self.slot.worker_id();
        // The dequeue wait may have used most of the threshold already.
        self.beat();

        let record = match TaskRecord::parse(&raw) {
            Ok(record) => record,
            Err(e) => {
                // No task id to report against; count and log only.
                error!(worker_id, error = %e, "Discarding undecodable queue record");
                self.slot.set_error(e.to_string());
                self.slot.record_outcome(false);
                self.beat();
                return;
            }
        };

        let task_id = record.task_id.clone();
        let task = match record.into_task() {
            Ok(task) => task,
            Err(e) => {
                error!(worker_id, task_id = %task_id, error = %e, "Task payload corrupt");
                let result = ProcessingResult::failure(&task_id, Outcome::Failed, 0, e.to_string())
                    .with_worker(worker_id);
                self.deps.dispatcher.record(&result).await;
                self.slot.set_error(e.to_string());
                self.slot.record_outcome(false);
                self.beat();
                return;
            }
        };

        debug!(worker_id, task_id = %task.task_id, filename = %task.attachment_filename, "Task dequeued");

        let slot = Arc::clone(&self.slot);
        let generation = self.generation;
        let heartbeat = move || {
            slot.heartbeat(generation);
        };
        let result = self
            .deps
            .dispatcher
            .dispatch(&task, &heartbeat)
            .await
            .with_worker(worker_id);

        self.deps.dispatcher.record(&result).await;
        if let Some(error) = &result.error {
            self.slot.set_error(error.clone());
        }
        self.slot.record_outcome(result.is_success());
        self.beat();
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::error::PipelineError;
    use crate::ingest::model::{AttachmentCandidate, SenderIdentity, SourceItem};
    use crate::pipeline::sink::MemoryResultSink;
    use crate::pipeline::types::{ItemContext, PipelineOutput, ProcessingPipeline};
    use crate::queue::store::MemoryTaskQueue;
    use crate::queue::task::Task;
    use crate::worker::dispatch::RetryPolicy;
    use crate::worker::state::WorkerState;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Records the filenames it sees, in order.
    #[derive(Default)]
    struct RecordingPipeline {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProcessingPipeline for RecordingPipeline {
        fn name(&self) -> &str {
            "recording"
        }

        async fn process(
            &self,
            _bytes: &[u8],
            _mime_type: &str,
            context: &ItemContext,
        ) -> Result<PipelineOutput, PipelineError> {
            self.seen.lock().await.push(context.filename.clone());
            Ok(PipelineOutput {
                processor: "recording".into(),
                content: serde_json::Value::Null,
            })
        }
    }

    fn task(name: &str) -> Task {
        let item = SourceItem::new(format!("m-{name}"), "s", SenderIdentity::default());
        let att = AttachmentCandidate::new("a", name, "", vec![1]);
        Task::from_attachment(&item, &att)
    }

    fn deps(queue: Arc<MemoryTaskQueue>, pipeline: Arc<RecordingPipeline>, sink: Arc<MemoryResultSink>) -> WorkerDeps {
        WorkerDeps {
            queue,
            dispatcher: Dispatcher::new(
                pipeline,
                sink,
                RetryPolicy {
                    timeout: Duration::from_secs(1),
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                },
            ),
            poll_timeout: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn single_worker_is_fifo() {
        let queue = Arc::new(MemoryTaskQueue::new("q"));
        for name in ["A.pdf", "B.pdf", "C.pdf"] {
            queue.append(task(name).encode().unwrap()).await.unwrap();
        }
        let pipeline = Arc::new(RecordingPipeline::default());
        let sink = Arc::new(MemoryResultSink::new(10));
        let slot = Arc::new(WorkerSlot::new("worker-0"));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = Worker::new(slot.clone(), stop.clone(), deps(queue, pipeline.clone(), sink.clone()));
        let handle = tokio::spawn(worker.run());

        tokio::time::timeout(TEST_TIMEOUT, async {
            while sink.len().await < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        stop.store(true, Ordering::SeqCst);
        tokio::time::timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();

        assert_eq!(*pipeline.seen.lock().await, vec!["A.pdf", "B.pdf", "C.pdf"]);
        let record = slot.snapshot();
        assert_eq!(record.processed, 3);
        assert_eq!(record.succeeded, 3);
        assert_eq!(record.state, WorkerState::Running);
        assert_eq!(sink.all().await[0].worker_id.as_deref(), Some("worker-0"));
    }

    #[tokio::test]
    async fn corrupt_payload_reports_failed_result() {
        let queue = Arc::new(MemoryTaskQueue::new("q"));
        let mut record = TaskRecord::parse(&task("x.pdf").encode().unwrap()).unwrap();
        record.attachment_content_b64 = "%%%".into();
        let task_id = record.task_id.clone();
        queue.append(serde_json::to_string(&record).unwrap()).await.unwrap();
        queue.append("not json at all".into()).await.unwrap();

        let sink = Arc::new(MemoryResultSink::new(10));
        let slot = Arc::new(WorkerSlot::new("worker-0"));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(
            slot.clone(),
            stop.clone(),
            deps(queue.clone(), Arc::new(RecordingPipeline::default()), sink.clone()),
        );
        let handle = tokio::spawn(worker.run());

        tokio::time::timeout(TEST_TIMEOUT, async {
            while slot.snapshot().processed < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        stop.store(true, Ordering::SeqCst);
        tokio::time::timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();

        let result = sink.get(&task_id).await.unwrap();
        assert_eq!(result.outcome, Outcome::Failed);
        assert_eq!(result.attempts, 0);
        assert_eq!(slot.snapshot().failed, 2);
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn idle_worker_keeps_heartbeating() {
        let queue = Arc::new(MemoryTaskQueue::new("q"));
        let slot = Arc::new(WorkerSlot::new("worker-0"));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(
            slot.clone(),
            stop.clone(),
            deps(queue, Arc::new(RecordingPipeline::default()), Arc::new(MemoryResultSink::new(1))),
        );
        let handle = tokio::spawn(worker.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(slot.heartbeat_age() < Duration::from_millis(150));

        stop.store(true, Ordering::SeqCst);
        tokio::time::timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    }

    /// Takes a fixed time per task.
    struct SteadyPipeline(Duration);

    #[async_trait]
    impl ProcessingPipeline for SteadyPipeline {
        fn name(&self) -> &str {
            "steady"
        }

        async fn process(
            &self,
            _bytes: &[u8],
            _mime_type: &str,
            _context: &ItemContext,
        ) -> Result<PipelineOutput, PipelineError> {
            tokio::time::sleep(self.0).await;
            Ok(PipelineOutput {
                processor: "steady".into(),
                content: serde_json::Value::Null,
            })
        }
    }

    #[tokio::test]
    async fn task_arriving_late_in_dequeue_wait_does_not_look_stale() {
        let queue = Arc::new(MemoryTaskQueue::new("q"));
        let sink = Arc::new(MemoryResultSink::new(10));
        let slot = Arc::new(WorkerSlot::new("worker-0"));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(
            slot.clone(),
            stop.clone(),
            WorkerDeps {
                queue: queue.clone(),
                dispatcher: Dispatcher::new(
                    Arc::new(SteadyPipeline(Duration::from_millis(200))),
                    sink.clone(),
                    RetryPolicy {
                        timeout: Duration::from_secs(1),
                        max_retries: 0,
                        base_delay: Duration::from_millis(1),
                    },
                ),
                poll_timeout: Duration::from_millis(300),
            },
        );
        let handle = tokio::spawn(worker.run());

        // Land the task near the end of the first dequeue wait.
        tokio::time::sleep(Duration::from_millis(250)).await;
        queue.append(task("late.pdf").encode().unwrap()).await.unwrap();

        // Without a beat on dequeue the age would reach wait + processing.
        let max_age = tokio::time::timeout(TEST_TIMEOUT, async {
            let mut max_age = Duration::ZERO;
            while sink.is_empty().await {
                max_age = max_age.max(slot.heartbeat_age());
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            max_age
        })
        .await
        .unwrap();
        assert!(max_age < Duration::from_millis(350), "heartbeat age reached {max_age:?}");

        stop.store(true, Ordering::SeqCst);
        tokio::time::timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
    }
}
