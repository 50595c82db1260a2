//! Dispatch of one task to the processing pipeline, with deadline and retry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{ServiceConfig, backoff_delay};
use crate::error::PipelineError;
use crate::pipeline::types::{ItemContext, Outcome, ProcessingPipeline, ProcessingResult, ResultSink};
use crate::queue::task::Task;

/// Default bound on a single `ResultSink::record` call.
pub const DEFAULT_SINK_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline and retry bounds for pipeline calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Deadline for each attempt.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Backoff before retry `n` (zero-based) is `base_delay * 2^n`.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            timeout: config.processing_timeout,
            max_retries: config.max_pipeline_retries,
            base_delay: config.retry_base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Runs tasks through the injected pipeline and hands results to the sink.
///
/// Shared by pool workers and by the producer's direct-processing fallback.
#[derive(Clone)]
pub struct Dispatcher {
    pipeline: Arc<dyn ProcessingPipeline>,
    sink: Arc<dyn ResultSink>,
    policy: RetryPolicy,
    sink_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        pipeline: Arc<dyn ProcessingPipeline>,
        sink: Arc<dyn ResultSink>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            pipeline,
            sink,
            policy,
            sink_timeout: DEFAULT_SINK_TIMEOUT,
        }
    }

    /// Bound each sink write. A write that overruns is abandoned and logged.
    pub fn with_sink_timeout(mut self, timeout: Duration) -> Self {
        self.sink_timeout = timeout;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn sink(&self) -> &Arc<dyn ResultSink> {
        &self.sink
    }

    /// Process `task`, retrying on failure or timeout. Never panics or
    /// returns an error: exhaustion yields a failed or timed-out result.
    ///
    /// `heartbeat` is called after every attempt and every backoff sleep.
    pub async fn dispatch(&self, task: &Task, heartbeat: &(dyn Fn() + Send + Sync)) -> ProcessingResult {
        let context = ItemContext::from_task(task);
        let max_attempts = self.policy.max_attempts();
        let mut last_outcome = Outcome::Failed;
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            debug!(
                task_id = %task.task_id,
                attempt = attempt + 1,
                max_attempts,
                pipeline = self.pipeline.name(),
                "Dispatching task"
            );

            let call = self.pipeline.process(
                &task.attachment_content,
                &task.attachment_mime_type,
                &context,
            );
            match tokio::time::timeout(self.policy.timeout, call).await {
                Ok(Ok(output)) => {
                    heartbeat();
                    info!(
                        task_id = %task.task_id,
                        processor = %output.processor,
                        attempts = attempt + 1,
                        "Task processed"
                    );
                    return ProcessingResult::success(&task.task_id, attempt + 1, output);
                }
                Ok(Err(e)) => {
                    last_outcome = Outcome::Failed;
                    last_error = e.to_string();
                }
                Err(_) => {
                    last_outcome = Outcome::Timeout;
                    last_error = PipelineError::Timeout {
                        timeout: self.policy.timeout,
                    }
                    .to_string();
                }
            }
            heartbeat();

            if attempt + 1 < max_attempts {
                let delay = backoff_delay(self.policy.base_delay, attempt);
                warn!(
                    task_id = %task.task_id,
                    attempt = attempt + 1,
                    error = %last_error,
                    retry_in_ms = delay.as_millis() as u64,
                    "Processing attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                heartbeat();
            }
        }

        error!(
            task_id = %task.task_id,
            attempts = max_attempts,
            outcome = %last_outcome,
            error = %last_error,
            "Processing failed after all retries"
        );
        ProcessingResult::failure(&task.task_id, last_outcome, max_attempts, last_error)
    }

    /// Hand a result to the sink within the sink deadline. Failures are
    /// logged, not propagated.
    pub async fn record(&self, result: &ProcessingResult) {
        match tokio::time::timeout(self.sink_timeout, self.sink.record(result)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(task_id = %result.task_id, error = %e, "Failed to record processing result");
            }
            Err(_) => {
                error!(
                    task_id = %result.task_id,
                    timeout_ms = self.sink_timeout.as_millis() as u64,
                    "Result sink timed out, result dropped"
                );
            }
        }
    }

    /// Dispatch and record in one step. Used for direct (non-queued) processing.
    pub async fn dispatch_and_record(&self, task: &Task) -> ProcessingResult {
        let result = self.dispatch(task, &|| {}).await;
        self.record(&result).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::ingest::model::{AttachmentCandidate, SenderIdentity, SourceItem};
    use crate::pipeline::sink::MemoryResultSink;
    use crate::pipeline::types::PipelineOutput;

    /// Fails the first `fail_first` calls, then succeeds.
    struct FlakyPipeline {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ProcessingPipeline for FlakyPipeline {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn process(
            &self,
            _bytes: &[u8],
            _mime_type: &str,
            _context: &ItemContext,
        ) -> Result<PipelineOutput, PipelineError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(PipelineError::Failed(format!("attempt {n} failed")))
            } else {
                Ok(PipelineOutput {
                    processor: "flaky".into(),
                    content: serde_json::Value::Null,
                })
            }
        }
    }

    struct SlowPipeline;

    #[async_trait]
    impl ProcessingPipeline for SlowPipeline {
        fn name(&self) -> &str {
            "slow"
        }

        async fn process(
            &self,
            _bytes: &[u8],
            _mime_type: &str,
            _context: &ItemContext,
        ) -> Result<PipelineOutput, PipelineError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(PipelineError::Failed("unreachable".into()))
        }
    }

    /// Never completes a write.
    struct StuckSink;

    #[async_trait]
    impl ResultSink for StuckSink {
        async fn record(&self, _result: &ProcessingResult) -> Result<(), crate::error::Error> {
            std::future::pending().await
        }

        async fn recent(&self, _limit: usize) -> Result<Vec<ProcessingResult>, crate::error::Error> {
            Ok(Vec::new())
        }
    }

    fn task() -> Task {
        let item = SourceItem::new("m1", "s", SenderIdentity::default());
        let att = AttachmentCandidate::new("a1", "f.pdf", "", vec![1, 2]);
        Task::from_attachment(&item, &att)
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(50),
            max_retries,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn always_failing_makes_retries_plus_one_attempts() {
        let pipeline = Arc::new(FlakyPipeline {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let sink = Arc::new(MemoryResultSink::new(10));
        let dispatcher = Dispatcher::new(pipeline.clone(), sink.clone(), policy(3));

        let result = dispatcher.dispatch_and_record(&task()).await;
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.error.as_deref().unwrap().contains("attempt 3 failed"));
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test]
    async fn recovers_within_retry_budget() {
        let pipeline = Arc::new(FlakyPipeline {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let dispatcher = Dispatcher::new(pipeline, Arc::new(MemoryResultSink::new(10)), policy(3));

        let result = dispatcher.dispatch(&task(), &|| {}).await;
        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let pipeline = Arc::new(FlakyPipeline {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let dispatcher =
            Dispatcher::new(pipeline.clone(), Arc::new(MemoryResultSink::new(10)), policy(0));
        let result = dispatcher.dispatch(&task(), &|| {}).await;
        assert_eq!(result.attempts, 1);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deadline_exceeded_is_timeout_outcome() {
        let dispatcher =
            Dispatcher::new(Arc::new(SlowPipeline), Arc::new(MemoryResultSink::new(10)), policy(1));
        let beats = AtomicU32::new(0);
        let result = dispatcher
            .dispatch(&task(), &|| {
                beats.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(result.outcome, Outcome::Timeout);
        assert_eq!(result.attempts, 2);
        // After each attempt plus after the single backoff sleep.
        assert_eq!(beats.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stuck_sink_is_abandoned_after_its_deadline() {
        let pipeline = Arc::new(FlakyPipeline {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let dispatcher = Dispatcher::new(pipeline, Arc::new(StuckSink), policy(0))
            .with_sink_timeout(Duration::from_millis(50));

        let started = tokio::time::Instant::now();
        let result = tokio::time::timeout(Duration::from_secs(5), dispatcher.dispatch_and_record(&task()))
            .await
            .expect("record must not hang on a stuck sink");
        assert!(result.is_success());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
