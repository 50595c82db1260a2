//! Source poller: fetch → filter → enqueue → advance cursor, on an interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::FallbackPolicy;
use crate::error::SourceError;
use crate::ingest::cursor::CursorStore;
use crate::ingest::filter::AttachmentFilter;
use crate::ingest::model::SourceItem;
use crate::ingest::source::SourceClient;
use crate::queue::producer::QueueProducer;
use crate::queue::task::Task;
use crate::worker::dispatch::Dispatcher;

// ── Handoff ─────────────────────────────────────────────────────────

/// Counts from handing items downstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HandoffReport {
    pub items: usize,
    pub enqueued: usize,
    /// Processed in-process because the queue refused them.
    pub direct: usize,
    /// Refused by the queue and dropped under the skip policy.
    pub skipped: usize,
    /// Dropped by the attachment filter.
    pub dropped: usize,
}

impl HandoffReport {
    fn absorb(&mut self, other: HandoffReport) {
        self.items += other.items;
        self.enqueued += other.enqueued;
        self.direct += other.direct;
        self.skipped += other.skipped;
        self.dropped += other.dropped;
    }
}

/// Filter plus producer plus queue-refusal fallback. Shared by the poller
/// and direct uploads.
pub struct Handoff {
    filter: AttachmentFilter,
    producer: QueueProducer,
    dispatcher: Dispatcher,
    fallback: FallbackPolicy,
}

impl Handoff {
    pub fn new(
        filter: AttachmentFilter,
        producer: QueueProducer,
        dispatcher: Dispatcher,
        fallback: FallbackPolicy,
    ) -> Self {
        Self {
            filter,
            producer,
            dispatcher,
            fallback,
        }
    }

    pub fn producer(&self) -> &QueueProducer {
        &self.producer
    }

    /// Turn every surviving attachment of `item` into a task, in filter order.
    /// Never fails: refusals go through the fallback policy.
    pub async fn hand_off(&self, item: &SourceItem) -> HandoffReport {
        let kept = self.filter.filter(item);
        let mut report = HandoffReport {
            items: 1,
            dropped: item.attachments.len() - kept.len(),
            ..Default::default()
        };

        if kept.is_empty() {
            debug!(item_id = %item.id, "Item has no attachments to process");
        }

        for attachment in &kept {
            let task = Task::from_attachment(item, attachment);
            match self.producer.enqueue(&task).await {
                Ok(()) => report.enqueued += 1,
                Err(reason) => match self.fallback {
                    FallbackPolicy::Direct => {
                        warn!(task_id = %task.task_id, %reason, "Enqueue refused, processing directly");
                        self.dispatcher.dispatch_and_record(&task).await;
                        report.direct += 1;
                    }
                    FallbackPolicy::Skip => {
                        warn!(
                            task_id = %task.task_id,
                            filename = %task.attachment_filename,
                            %reason,
                            "Enqueue refused, skipping task"
                        );
                        report.skipped += 1;
                    }
                },
            }
        }
        report
    }

    pub async fn hand_off_all(&self, items: &[SourceItem]) -> HandoffReport {
        let mut report = HandoffReport::default();
        for item in items {
            report.absorb(self.hand_off(item).await);
        }
        report
    }
}

// ── Poller ──────────────────────────────────────────────────────────

/// Where the poller is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    Idle,
    Polling,
    /// Credentials rejected; scheduled polls are suspended.
    Halted,
}

/// Read-only view of the poller for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct PollerStatus {
    pub source: String,
    pub state: PollState,
    pub polls: u64,
    pub last_poll_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cursor_issued_at: Option<DateTime<Utc>>,
    pub totals: HandoffReport,
}

/// Result of one poll request.
#[derive(Debug)]
pub enum PollOutcome {
    Completed(HandoffReport),
    /// Another poll was already running.
    InProgress,
    /// Polling is halted on an auth failure.
    Halted,
    Failed(SourceError),
}

/// Drives a [`SourceClient`]. At most one poll runs at a time.
pub struct SourcePoller {
    source: Arc<dyn SourceClient>,
    cursors: Arc<dyn CursorStore>,
    handoff: Arc<Handoff>,
    interval: Duration,
    in_flight: Mutex<()>,
    status: RwLock<PollerStatus>,
}

impl SourcePoller {
    pub fn new(
        source: Arc<dyn SourceClient>,
        cursors: Arc<dyn CursorStore>,
        handoff: Arc<Handoff>,
        interval: Duration,
    ) -> Self {
        let status = PollerStatus {
            source: source.name().to_string(),
            state: PollState::Idle,
            polls: 0,
            last_poll_at: None,
            last_success_at: None,
            last_error: None,
            cursor_issued_at: None,
            totals: HandoffReport::default(),
        };
        Self {
            source,
            cursors,
            handoff,
            interval,
            in_flight: Mutex::new(()),
            status: RwLock::new(status),
        }
    }

    pub async fn status(&self) -> PollerStatus {
        self.status.read().await.clone()
    }

    /// Scheduled poll. Suppressed while another poll runs or while halted.
    pub async fn poll_once(&self) -> PollOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!(source = %self.source.name(), "Poll already in progress, skipping");
            return PollOutcome::InProgress;
        };
        if self.status.read().await.state == PollState::Halted {
            return PollOutcome::Halted;
        }
        self.run_poll().await
    }

    /// Operator-triggered poll. Clears an auth halt first, so it doubles as
    /// "credentials fixed, try again".
    pub async fn poll_now(&self) -> PollOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            return PollOutcome::InProgress;
        };
        self.run_poll().await
    }

    /// Forget the cursor so the next poll is a baseline sync.
    pub async fn reset_cursor(&self) -> Result<(), crate::error::DatabaseError> {
        let _guard = self.in_flight.lock().await;
        self.cursors.reset().await?;
        self.status.write().await.cursor_issued_at = None;
        info!(source = %self.source.name(), "Sync cursor reset");
        Ok(())
    }

    async fn run_poll(&self) -> PollOutcome {
        {
            let mut status = self.status.write().await;
            status.state = PollState::Polling;
            status.polls += 1;
            status.last_poll_at = Some(Utc::now());
        }

        let cursor = match self.cursors.read().await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(source = %self.source.name(), error = %e, "Failed to read sync cursor");
                return self
                    .finish_failed(SourceError::Transient {
                        source_name: self.source.name().to_string(),
                        reason: format!("cursor read failed: {e}"),
                    })
                    .await;
            }
        };

        let batch = match self.source.poll(cursor.as_ref()).await {
            Ok(batch) => batch,
            Err(e) => return self.finish_failed(e).await,
        };

        let report = self.handoff.hand_off_all(&batch.items).await;

        // Only after handoff. A crash before this re-fetches the same batch,
        // which maps onto the same task ids.
        let cursor_error = match self.cursors.write(&batch.next_cursor).await {
            Ok(()) => None,
            Err(e) => {
                error!(source = %self.source.name(), error = %e, "Failed to persist sync cursor");
                Some(format!("cursor write failed: {e}"))
            }
        };

        info!(
            source = %self.source.name(),
            items = report.items,
            enqueued = report.enqueued,
            direct = report.direct,
            skipped = report.skipped,
            dropped = report.dropped,
            "Poll complete"
        );

        let mut status = self.status.write().await;
        status.state = PollState::Idle;
        status.last_success_at = Some(Utc::now());
        // Items were handed off either way; the stale cursor only means the
        // next poll refetches them.
        match cursor_error {
            None => {
                status.last_error = None;
                status.cursor_issued_at = Some(batch.next_cursor.issued_at);
            }
            Some(e) => status.last_error = Some(e),
        }
        status.totals.absorb(report);
        PollOutcome::Completed(report)
    }

    async fn finish_failed(&self, e: SourceError) -> PollOutcome {
        let mut status = self.status.write().await;
        status.last_error = Some(e.to_string());
        if e.is_auth() {
            error!(source = %self.source.name(), error = %e, "Source rejected credentials, polling halted");
            status.state = PollState::Halted;
        } else {
            warn!(source = %self.source.name(), error = %e, "Poll failed, retrying next tick");
            status.state = PollState::Idle;
        }
        PollOutcome::Failed(e)
    }

    /// Spawn the interval loop. Returns a `JoinHandle` and a shutdown flag.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            info!(
                source = %self.source.name(),
                interval_secs = self.interval.as_secs(),
                "Source poller started"
            );
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tick.tick().await;
                if shutdown.load(Ordering::Relaxed) {
                    info!(source = %self.source.name(), "Source poller shutting down");
                    return;
                }
                self.poll_once().await;
            }
        });

        (handle, shutdown_flag)
    }
}
