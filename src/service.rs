//! Process-scoped service: builds every component once at startup, exposes
//! the operator surface, and tears everything down at shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::ingest::cursor::CursorStore;
use crate::ingest::filter::{AttachmentFilter, FilterPolicy};
use crate::ingest::graph::GraphMailSource;
use crate::ingest::model::SourceItem;
use crate::ingest::poller::{Handoff, HandoffReport, PollOutcome, PollerStatus, SourcePoller};
use crate::ingest::rfc822;
use crate::ingest::source::SourceClient;
use crate::pipeline::registry::{ExtractionPipeline, ProcessorRegistry};
use crate::pipeline::types::{ProcessingPipeline, ProcessingResult, ResultSink};
use crate::queue::inspect::{self, QueueHealth, QueueStats};
use crate::queue::producer::QueueProducer;
use crate::queue::store::TaskQueue;
use crate::queue::task::{TaskRecord, redact_record};
use crate::store::LibSqlBackend;
use crate::worker::dispatch::{Dispatcher, RetryPolicy};
use crate::worker::pool::{PoolSettings, PoolStats, WorkerPool};
use crate::worker::worker::WorkerDeps;

/// Injected collaborators. `source` is optional: without one the service
/// only takes direct uploads.
pub struct Collaborators {
    pub queue: Arc<dyn TaskQueue>,
    pub cursors: Arc<dyn CursorStore>,
    pub sink: Arc<dyn ResultSink>,
    pub pipeline: Arc<dyn ProcessingPipeline>,
    pub source: Option<Arc<dyn SourceClient>>,
}

/// Point-in-time view of the whole service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub queue_name: String,
    /// `None` when the queue store could not be reached.
    pub queue_depth: Option<usize>,
    pub queue_capacity: usize,
    pub queue_error: Option<String>,
    pub workers: PoolStats,
    pub poller: Option<PollerStatus>,
    pub started_at: DateTime<Utc>,
}

/// Result of a direct upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub item_id: String,
    pub attachments: usize,
    pub report: HandoffReport,
}

pub struct IntakeService {
    config: ServiceConfig,
    queue: Arc<dyn TaskQueue>,
    sink: Arc<dyn ResultSink>,
    handoff: Arc<Handoff>,
    pool: Arc<WorkerPool>,
    poller: Option<Arc<SourcePoller>>,
    poller_task: Mutex<Option<(JoinHandle<()>, Arc<AtomicBool>)>>,
    started_at: DateTime<Utc>,
}

impl IntakeService {
    /// Wire the service from explicit collaborators.
    pub fn new(config: ServiceConfig, parts: Collaborators) -> Self {
        let dispatcher = Dispatcher::new(
            parts.pipeline,
            Arc::clone(&parts.sink),
            RetryPolicy::from_config(&config),
        )
        .with_sink_timeout(config.result_sink_timeout);

        let handoff = Arc::new(Handoff::new(
            AttachmentFilter::new(FilterPolicy {
                allowed_extensions: config.allowed_extensions.clone(),
                max_size_bytes: config.max_attachment_size,
            }),
            QueueProducer::new(Arc::clone(&parts.queue), config.max_queue_size),
            dispatcher.clone(),
            config.queue_fallback,
        ));

        let pool = Arc::new(WorkerPool::new(
            PoolSettings::from_config(&config),
            WorkerDeps {
                queue: Arc::clone(&parts.queue),
                dispatcher,
                poll_timeout: config.worker_poll_interval,
            },
        ));

        let poller = parts.source.map(|source| {
            Arc::new(SourcePoller::new(
                source,
                parts.cursors,
                Arc::clone(&handoff),
                config.source_poll_interval,
            ))
        });

        Self {
            config,
            queue: parts.queue,
            sink: parts.sink,
            handoff,
            pool,
            poller,
            poller_task: Mutex::new(None),
            started_at: Utc::now(),
        }
    }

    /// Production wiring: libSQL for queue, cursor and results, the built-in
    /// processor registry, and the Graph source when configured.
    pub async fn open(config: ServiceConfig) -> Result<Self> {
        let db = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);

        let source: Option<Arc<dyn SourceClient>> = match &config.graph {
            Some(graph) => Some(Arc::new(GraphMailSource::from_config(
                graph,
                config.source_membership.clone(),
            )?)),
            None => {
                info!("No mail source configured, accepting uploads only");
                None
            }
        };
        let source_name = source
            .as_ref()
            .map(|s| s.name().to_string())
            .unwrap_or_else(|| "none".to_string());

        let registry = Arc::new(ProcessorRegistry::with_builtins());
        let parts = Collaborators {
            queue: Arc::new(db.task_queue(config.queue_name.clone())),
            cursors: Arc::new(db.cursor_store(source_name)),
            sink: db,
            pipeline: Arc::new(ExtractionPipeline::new(registry)),
            source,
        };
        Ok(Self::new(config, parts))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Start the worker pool and the poller loop.
    pub async fn start(&self) -> Result<()> {
        self.pool.start().await?;
        if let Some(poller) = &self.poller {
            *self.poller_task.lock().await = Some(Arc::clone(poller).spawn());
        }
        info!(
            workers = self.config.max_concurrent_workers,
            queue = %self.config.queue_name,
            polling = self.poller.is_some(),
            "Attachment intake started"
        );
        Ok(())
    }

    /// Stop polling, then drain workers within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        if let Some((handle, stop)) = self.poller_task.lock().await.take() {
            stop.store(true, Ordering::Relaxed);
            // A poll cut short never wrote its cursor; the batch is re-fetched.
            handle.abort();
        }
        self.pool.shutdown(grace).await?;
        info!("Attachment intake stopped");
        Ok(())
    }

    pub async fn stats(&self) -> ServiceStats {
        let (queue_depth, queue_error) = match self.queue.length().await {
            Ok(depth) => (Some(depth), None),
            Err(e) => (None, Some(e.to_string())),
        };
        let poller = match &self.poller {
            Some(p) => Some(p.status().await),
            None => None,
        };
        ServiceStats {
            queue_name: self.queue.name().to_string(),
            queue_depth,
            queue_capacity: self.config.max_queue_size,
            queue_error,
            workers: self.pool.stats().await,
            poller,
            started_at: self.started_at,
        }
    }

    /// Hand one item straight to filter and producer, bypassing the source.
    pub async fn enqueue_now(&self, item: &SourceItem) -> HandoffReport {
        self.handoff.hand_off(item).await
    }

    /// Ingest an uploaded file or RFC 822 message.
    pub async fn upload(
        &self,
        filename: &str,
        mime_type: &str,
        bytes: &[u8],
        uploader: &str,
    ) -> UploadReceipt {
        let item = rfc822::item_from_upload(filename, mime_type, bytes, uploader);
        let report = self.enqueue_now(&item).await;
        info!(item_id = %item.id, filename, enqueued = report.enqueued, "Upload ingested");
        UploadReceipt {
            item_id: item.id,
            attachments: item.attachments.len(),
            report,
        }
    }

    /// Cooperatively restart every worker. Returns how many were signalled.
    pub async fn restart_workers(&self) -> Result<usize> {
        Ok(self.pool.restart_all().await?)
    }

    /// Operator-triggered poll. `None` when no source is configured.
    pub async fn poll_now(&self) -> Option<PollOutcome> {
        match &self.poller {
            Some(poller) => Some(poller.poll_now().await),
            None => None,
        }
    }

    /// Oldest `count` queued tasks with content redacted.
    pub async fn peek_queue(&self, count: usize) -> Result<Vec<serde_json::Value>> {
        let records = self.queue.peek(count).await?;
        Ok(records.iter().map(|raw| redact_record(raw)).collect())
    }

    /// Sampled size and file-type statistics for the queue.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(inspect::queue_stats(self.queue.as_ref(), self.config.max_queue_size).await?)
    }

    pub async fn queue_health(&self) -> QueueHealth {
        inspect::health_check(self.queue.as_ref()).await
    }

    /// A still-queued task by id, content redacted.
    pub async fn find_queued(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let found = inspect::find_task(self.queue.as_ref(), task_id).await?;
        Ok(found.map(|record| record.redacted()))
    }

    pub async fn clear_queue(&self) -> Result<usize> {
        let removed = self.queue.clear().await?;
        warn!(queue = %self.queue.name(), removed, "Queue cleared by operator");
        Ok(removed)
    }

    /// Forget the sync cursor. `false` when no source is configured.
    pub async fn reset_cursor(&self) -> Result<bool> {
        match &self.poller {
            Some(poller) => {
                poller.reset_cursor().await.map_err(Error::from)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn recent_results(&self, limit: usize) -> Result<Vec<ProcessingResult>> {
        self.sink.recent(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::cursor::MemoryCursorStore;
    use crate::ingest::model::{AttachmentCandidate, SenderIdentity};
    use crate::ingest::source::MemorySource;
    use crate::pipeline::sink::MemoryResultSink;
    use crate::queue::store::MemoryTaskQueue;

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    fn config() -> ServiceConfig {
        ServiceConfig {
            max_queue_size: 10,
            allowed_extensions: vec![".txt".into(), ".pdf".into()],
            max_concurrent_workers: 2,
            worker_poll_interval: Duration::from_millis(20),
            processing_timeout: Duration::from_secs(2),
            retry_base_delay: Duration::from_millis(1),
            max_pipeline_retries: 0,
            source_poll_interval: Duration::from_secs(3600),
            heartbeat_timeout: Duration::from_secs(5),
            heartbeat_check_interval: Duration::from_millis(50),
            api_port: None,
            ..ServiceConfig::default()
        }
    }

    fn service(source: Option<Arc<MemorySource>>) -> (IntakeService, Arc<MemoryTaskQueue>, Arc<MemoryResultSink>) {
        let queue = Arc::new(MemoryTaskQueue::new("q"));
        let sink = Arc::new(MemoryResultSink::new(100));
        let parts = Collaborators {
            queue: queue.clone(),
            cursors: Arc::new(MemoryCursorStore::new()),
            sink: sink.clone(),
            pipeline: Arc::new(ExtractionPipeline::new(Arc::new(ProcessorRegistry::with_builtins()))),
            source: source.map(|s| s as Arc<dyn SourceClient>),
        };
        (IntakeService::new(config(), parts), queue, sink)
    }

    #[tokio::test]
    async fn enqueue_now_without_workers_stays_queued() {
        let (svc, queue, _) = service(None);
        let item = SourceItem::new("m1", "s", SenderIdentity::default())
            .with_attachment(AttachmentCandidate::new("a1", "x.txt", "", b"hi".to_vec()));

        let report = svc.enqueue_now(&item).await;
        assert_eq!(report.enqueued, 1);
        assert_eq!(queue.length().await.unwrap(), 1);

        let peeked = svc.peek_queue(5).await.unwrap();
        assert_eq!(peeked[0]["attachment_content_b64"], "<4 characters>");
        assert_eq!(svc.clear_queue().await.unwrap(), 1);
        assert_eq!(svc.stats().await.queue_depth, Some(0));
    }

    #[tokio::test]
    async fn started_service_processes_uploads() {
        let (svc, _, sink) = service(None);
        svc.start().await.unwrap();

        let receipt = svc.upload("notes.txt", "text/plain", b"hello world", "").await;
        assert_eq!(receipt.report.enqueued, 1);

        tokio::time::timeout(TEST_TIMEOUT, async {
            while sink.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let results = svc.recent_results(10).await.unwrap();
        assert!(results[0].is_success());
        assert!(results[0].worker_id.is_some());

        let stats = svc.stats().await;
        assert_eq!(stats.workers.live, 2);
        assert_eq!(stats.workers.succeeded, 1);
        assert!(stats.poller.is_none());

        svc.shutdown(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn poll_now_and_cursor_reset_need_a_source() {
        let (svc, _, _) = service(None);
        assert!(svc.poll_now().await.is_none());
        assert!(!svc.reset_cursor().await.unwrap());

        let source = Arc::new(MemorySource::new("mem", Vec::new()));
        source
            .push(
                SourceItem::new("m1", "s", SenderIdentity::new("", "a@b.c"))
                    .with_attachment(AttachmentCandidate::new("a1", "x.pdf", "", vec![1])),
            )
            .await;
        let (svc, queue, _) = service(Some(source));
        assert!(matches!(svc.poll_now().await, Some(PollOutcome::Completed(r)) if r.enqueued == 1));
        assert!(svc.reset_cursor().await.unwrap());
        assert_eq!(queue.length().await.unwrap(), 1);
        assert_eq!(svc.stats().await.poller.unwrap().polls, 1);
    }

    #[tokio::test]
    async fn restart_requires_running_pool() {
        let (svc, _, _) = service(None);
        assert!(svc.restart_workers().await.is_err());
        svc.start().await.unwrap();
        assert_eq!(svc.restart_workers().await.unwrap(), 2);
        svc.shutdown(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn queue_inspection_views() {
        let (svc, queue, _) = service(None);
        let item = SourceItem::new("m1", "s", SenderIdentity::default())
            .with_attachment(AttachmentCandidate::new("a1", "x.txt", "", b"hi".to_vec()))
            .with_attachment(AttachmentCandidate::new("a2", "y.pdf", "", vec![1; 6]));
        svc.enqueue_now(&item).await;

        let stats = svc.queue_stats().await.unwrap();
        assert_eq!(stats.queue_length, 2);
        assert_eq!(stats.utilization_percent, 20.0);
        assert_eq!(stats.avg_attachment_size, 4.0);

        let task_id = crate::queue::task::derive_task_id("m1", "a2");
        let found = svc.find_queued(&task_id).await.unwrap().unwrap();
        assert_eq!(found.attachment_filename, "y.pdf");
        assert_eq!(found.attachment_content_b64, "<8 characters>");
        assert!(svc.find_queued("absent").await.unwrap().is_none());

        assert!(svc.queue_health().await.is_healthy());
        queue.set_available(false);
        assert!(!svc.queue_health().await.is_healthy());
        assert!(svc.queue_stats().await.is_err());
    }
}
