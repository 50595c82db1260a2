//! Worker pool manager: keeps N workers alive, supervises heartbeats,
//! restarts crashed or stale workers, and aggregates stats.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::error::WorkerError;
use crate::worker::state::{WorkerRecord, WorkerSlot, WorkerState};
use crate::worker::worker::{Worker, WorkerDeps};

/// Supervision settings.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    /// Target number of concurrently running workers.
    pub size: usize,
    /// A worker silent for longer than this is hard-restarted.
    pub heartbeat_timeout: Duration,
    /// How often the monitor inspects the pool.
    pub check_interval: Duration,
    /// Unplanned restarts allowed per slot before it is given up (0 = unlimited).
    pub max_restarts: u32,
}

impl PoolSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            size: config.max_concurrent_workers,
            heartbeat_timeout: config.heartbeat_timeout,
            check_interval: config.heartbeat_check_interval,
            max_restarts: config.max_worker_restarts,
        }
    }
}

/// Aggregate counters plus per-worker records.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub target_size: usize,
    pub live: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub restarts: u32,
    pub workers: Vec<WorkerRecord>,
}

/// A slot plus the currently running instance, if any.
struct Member {
    slot: Arc<WorkerSlot>,
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Member {
    fn is_live(&self) -> bool {
        self.slot.state() != WorkerState::Stopped
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Owns and supervises the worker instances.
pub struct WorkerPool {
    settings: PoolSettings,
    deps: WorkerDeps,
    members: Mutex<Vec<Member>>,
    running: AtomicBool,
    /// Signalled whenever a worker exits cleanly, so cooperative restarts are
    /// picked up without waiting for the next tick.
    exited: Arc<Notify>,
    monitor: Mutex<Option<(JoinHandle<()>, Arc<AtomicBool>)>>,
}

impl WorkerPool {
    pub fn new(settings: PoolSettings, deps: WorkerDeps) -> Self {
        Self {
            settings,
            deps,
            members: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            exited: Arc::new(Notify::new()),
            monitor: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn `size` workers and the supervision loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }

        {
            let mut members = self.members.lock().await;
            members.clear();
            for i in 0..self.settings.size {
                let slot = Arc::new(WorkerSlot::new(format!("worker-{i}")));
                let (handle, stop) = self.spawn_instance(&slot);
                members.push(Member {
                    slot,
                    handle: Some(handle),
                    stop,
                });
            }
        }

        *self.monitor.lock().await = Some(self.spawn_monitor());

        info!(
            workers = self.settings.size,
            heartbeat_timeout_secs = self.settings.heartbeat_timeout.as_secs(),
            "Worker pool started"
        );
        Ok(())
    }

    fn spawn_instance(&self, slot: &Arc<WorkerSlot>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(Arc::clone(slot), Arc::clone(&stop), self.deps.clone());
        let exited = Arc::clone(&self.exited);
        let handle = tokio::spawn(async move {
            worker.run().await;
            exited.notify_one();
        });
        (handle, stop)
    }

    fn spawn_monitor(self: &Arc<Self>) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = Arc::clone(&shutdown);
        let pool = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.settings.check_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = pool.exited.notified() => {}
                }

                if shutdown.load(Ordering::SeqCst) {
                    debug!("Worker monitor shutting down");
                    return;
                }

                let restarted = pool.check_workers().await;
                if !restarted.is_empty() {
                    debug!(?restarted, "Worker monitor replaced workers");
                }
            }
        });

        (handle, shutdown_flag)
    }

    /// One supervision pass. Returns the ids of slots that got a new instance.
    pub async fn check_workers(&self) -> Vec<String> {
        if !self.is_running() {
            return Vec::new();
        }

        let mut restarted = Vec::new();
        let mut members = self.members.lock().await;

        for member in members.iter_mut() {
            let state = member.slot.state();
            if state == WorkerState::Stopped {
                continue;
            }
            let worker_id = member.slot.worker_id().to_string();

            let finished = member.handle.as_ref().is_none_or(|h| h.is_finished());
            if finished {
                let reason = match member.handle.take() {
                    Some(handle) => match handle.await {
                        Ok(()) => None,
                        Err(e) if e.is_panic() => Some(format!("panicked: {e}")),
                        Err(e) => Some(format!("aborted: {e}")),
                    },
                    None => Some("no running instance".to_string()),
                };

                if state == WorkerState::Restarting && reason.is_none() {
                    // Cooperative exit after a restart request.
                    info!(worker_id = %worker_id, "Worker restarted on request");
                    self.respawn(member);
                    restarted.push(worker_id);
                    continue;
                }

                let reason = reason.unwrap_or_else(|| "exited unexpectedly".to_string());
                let crash = WorkerError::Crashed {
                    worker_id: worker_id.clone(),
                    reason,
                };
                warn!(worker_id = %worker_id, error = %crash, "Worker crashed");
                member.slot.set_error(crash.to_string());
                if self.restart_unplanned(member) {
                    restarted.push(worker_id);
                }
                continue;
            }

            let age = member.slot.heartbeat_age();
            if age > self.settings.heartbeat_timeout {
                warn!(
                    worker_id = %worker_id,
                    silent_secs = age.as_secs(),
                    "Worker heartbeat stale, hard restart"
                );
                // The in-flight task (if any) is lost with the instance.
                if let Some(handle) = member.handle.take() {
                    handle.abort();
                }
                member
                    .slot
                    .set_error(format!("heartbeat stale for {}s", age.as_secs()));
                if self.restart_unplanned(member) {
                    restarted.push(worker_id);
                }
            }
        }

        restarted
    }

    /// Count an unplanned restart and respawn, unless the slot is out of
    /// restarts. Returns whether a new instance was spawned.
    fn restart_unplanned(&self, member: &mut Member) -> bool {
        let total = member.slot.note_restart();
        let max = self.settings.max_restarts;
        if max > 0 && total > max {
            let err = WorkerError::RestartsExhausted {
                worker_id: member.slot.worker_id().to_string(),
                max,
            };
            error!(error = %err, "Giving up on worker slot");
            member.slot.set_error(err.to_string());
            let _ = member.slot.transition_to(WorkerState::Stopped, Some("restarts exhausted"));
            return false;
        }
        let _ = member.slot.transition_to(WorkerState::Restarting, Some("unplanned restart"));
        self.respawn(member);
        true
    }

    fn respawn(&self, member: &mut Member) {
        let (handle, stop) = self.spawn_instance(&member.slot);
        member.handle = Some(handle);
        member.stop = stop;
    }

    /// Ask every worker to finish its current task and restart.
    pub async fn restart_all(&self) -> Result<usize, WorkerError> {
        if !self.is_running() {
            return Err(WorkerError::NotRunning);
        }
        let members = self.members.lock().await;
        let mut signalled = 0;
        for member in members.iter() {
            if member
                .slot
                .transition_to(WorkerState::Restarting, Some("restart requested"))
                .is_ok()
            {
                member.stop.store(true, Ordering::SeqCst);
                signalled += 1;
            }
        }
        info!(signalled, "Restart requested for all workers");
        Ok(signalled)
    }

    /// Hard-kill the current instance of one worker. The monitor treats it
    /// as a crash and replaces it on its next pass.
    pub async fn terminate(&self, worker_id: &str) -> Result<(), WorkerError> {
        let members = self.members.lock().await;
        let member = members
            .iter()
            .find(|m| m.slot.worker_id() == worker_id)
            .ok_or_else(|| WorkerError::NotFound {
                worker_id: worker_id.to_string(),
            })?;
        if let Some(handle) = &member.handle {
            handle.abort();
        }
        warn!(worker_id, "Worker terminated");
        Ok(())
    }

    /// Workers with a live instance.
    pub async fn live_count(&self) -> usize {
        self.members.lock().await.iter().filter(|m| m.is_live()).count()
    }

    pub async fn records(&self) -> Vec<WorkerRecord> {
        self.members
            .lock()
            .await
            .iter()
            .map(|m| m.slot.snapshot())
            .collect()
    }

    pub async fn stats(&self) -> PoolStats {
        let members = self.members.lock().await;
        let workers: Vec<WorkerRecord> = members.iter().map(|m| m.slot.snapshot()).collect();
        PoolStats {
            target_size: self.settings.size,
            live: members.iter().filter(|m| m.is_live()).count(),
            processed: workers.iter().map(|w| w.processed).sum(),
            succeeded: workers.iter().map(|w| w.succeeded).sum(),
            failed: workers.iter().map(|w| w.failed).sum(),
            restarts: workers.iter().map(|w| w.restarts).sum(),
            workers,
        }
    }

    /// Stop supervising, let workers finish their current task within
    /// `grace`, then abort whatever is left.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), WorkerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(WorkerError::NotRunning);
        }

        if let Some((handle, shutdown)) = self.monitor.lock().await.take() {
            shutdown.store(true, Ordering::SeqCst);
            handle.abort();
        }

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        for member in self.members.lock().await.iter_mut() {
            member.stop.store(true, Ordering::SeqCst);
            let _ = member
                .slot
                .transition_to(WorkerState::Stopped, Some("pool shutdown"));
            handles.extend(member.handle.take());
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "Workers did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        info!("Worker pool stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::error::PipelineError;
    use crate::ingest::model::{AttachmentCandidate, SenderIdentity, SourceItem};
    use crate::pipeline::sink::MemoryResultSink;
    use crate::pipeline::types::{ItemContext, PipelineOutput, ProcessingPipeline};
    use crate::queue::store::{MemoryTaskQueue, TaskQueue};
    use crate::queue::task::Task;
    use crate::worker::dispatch::{Dispatcher, RetryPolicy};

    const TEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Succeeds quickly, except for filenames starting with `hang` (sleeps
    /// far past any deadline) or `panic` (panics the worker).
    #[derive(Default)]
    struct ScriptedPipeline {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProcessingPipeline for ScriptedPipeline {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn process(
            &self,
            _bytes: &[u8],
            _mime_type: &str,
            context: &ItemContext,
        ) -> Result<PipelineOutput, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if context.filename.starts_with("hang") {
                std::future::pending::<()>().await;
            }
            if context.filename.starts_with("panic") {
                panic!("pipeline blew up");
            }
            Ok(PipelineOutput {
                processor: "scripted".into(),
                content: serde_json::Value::Null,
            })
        }
    }

    fn task(name: &str) -> Task {
        let item = SourceItem::new(format!("m-{name}"), "s", SenderIdentity::default());
        let att = AttachmentCandidate::new("a", name, "", vec![1]);
        Task::from_attachment(&item, &att)
    }

    struct Harness {
        pool: Arc<WorkerPool>,
        queue: Arc<MemoryTaskQueue>,
        sink: Arc<MemoryResultSink>,
    }

    fn harness(size: usize, settings: impl FnOnce(&mut PoolSettings), processing_timeout: Duration) -> Harness {
        let queue = Arc::new(MemoryTaskQueue::new("q"));
        let sink = Arc::new(MemoryResultSink::new(100));
        let deps = WorkerDeps {
            queue: queue.clone(),
            dispatcher: Dispatcher::new(
                Arc::new(ScriptedPipeline::default()),
                sink.clone(),
                RetryPolicy {
                    timeout: processing_timeout,
                    max_retries: 0,
                    base_delay: Duration::from_millis(1),
                },
            ),
            poll_timeout: Duration::from_millis(20),
        };
        let mut s = PoolSettings {
            size,
            heartbeat_timeout: Duration::from_secs(60),
            check_interval: Duration::from_millis(50),
            max_restarts: 0,
        };
        settings(&mut s);
        Harness {
            pool: Arc::new(WorkerPool::new(s, deps)),
            queue,
            sink,
        }
    }

    async fn wait_for<F, Fut>(mut cond: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(TEST_TIMEOUT, async {
            while !cond().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn starts_n_workers_and_drains_queue() {
        let h = harness(3, |_| {}, Duration::from_secs(1));
        for i in 0..9 {
            h.queue.append(task(&format!("f{i}.pdf")).encode().unwrap()).await.unwrap();
        }
        h.pool.start().await.unwrap();
        assert_eq!(h.pool.live_count().await, 3);

        let sink = h.sink.clone();
        wait_for(|| {
            let sink = sink.clone();
            async move { sink.len().await == 9 }
        })
        .await;

        let stats = h.pool.stats().await;
        assert_eq!(stats.processed, 9);
        assert_eq!(stats.succeeded, 9);
        assert_eq!(stats.workers.len(), 3);

        h.pool.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(h.pool.live_count().await, 0);
        assert!(h
            .pool
            .records()
            .await
            .iter()
            .all(|r| r.state == WorkerState::Stopped));
    }

    #[tokio::test]
    async fn double_start_rejected() {
        let h = harness(1, |_| {}, Duration::from_secs(1));
        h.pool.start().await.unwrap();
        assert!(matches!(h.pool.start().await, Err(WorkerError::AlreadyRunning)));
        h.pool.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn terminated_worker_is_replaced() {
        let h = harness(3, |_| {}, Duration::from_secs(1));
        h.pool.start().await.unwrap();

        h.pool.terminate("worker-1").await.unwrap();

        // Replacement arrives within one check interval (plus scheduling slack).
        let pool = h.pool.clone();
        tokio::time::timeout(Duration::from_millis(500), async move {
            while pool.stats().await.restarts < 1 || pool.live_count().await < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let record = h
            .pool
            .records()
            .await
            .into_iter()
            .find(|r| r.worker_id == "worker-1")
            .unwrap();
        assert_eq!(record.restarts, 1);
        assert!(record.last_error.unwrap().contains("worker-1"));

        h.pool.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn panicking_worker_is_replaced_and_pool_keeps_going() {
        let h = harness(1, |_| {}, Duration::from_secs(1));
        h.queue.append(task("panic.pdf").encode().unwrap()).await.unwrap();
        h.queue.append(task("fine.pdf").encode().unwrap()).await.unwrap();
        h.pool.start().await.unwrap();

        let sink = h.sink.clone();
        wait_for(|| {
            let sink = sink.clone();
            async move { sink.len().await == 1 }
        })
        .await;

        // The panicked task was lost with its worker; only the second one has a result.
        let results = h.sink.all().await;
        assert_eq!(results[0].task_id, task("fine.pdf").task_id);
        assert_eq!(h.pool.stats().await.restarts, 1);

        h.pool.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stale_worker_is_hard_restarted_and_task_lost() {
        // Deadline far beyond the heartbeat threshold, so the worker goes silent.
        let h = harness(
            1,
            |s| s.heartbeat_timeout = Duration::from_millis(150),
            Duration::from_secs(60),
        );
        h.queue.append(task("hang.pdf").encode().unwrap()).await.unwrap();
        h.pool.start().await.unwrap();

        let pool = h.pool.clone();
        wait_for(|| {
            let pool = pool.clone();
            async move { pool.stats().await.restarts >= 1 }
        })
        .await;

        assert_eq!(h.queue.length().await.unwrap(), 0);
        assert!(h.sink.is_empty().await);
        let pool = h.pool.clone();
        wait_for(|| {
            let pool = pool.clone();
            async move { pool.records().await[0].state == WorkerState::Running }
        })
        .await;

        h.pool.shutdown(Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn restart_all_is_cooperative() {
        let h = harness(2, |s| s.check_interval = Duration::from_secs(30), Duration::from_secs(1));
        h.pool.start().await.unwrap();

        let pool = h.pool.clone();
        wait_for(|| {
            let pool = pool.clone();
            async move {
                pool.records()
                    .await
                    .iter()
                    .all(|r| r.state == WorkerState::Running)
            }
        })
        .await;

        assert_eq!(h.pool.restart_all().await.unwrap(), 2);

        // Exits wake the monitor, so this does not wait for the 30s tick.
        let pool = h.pool.clone();
        wait_for(|| {
            let pool = pool.clone();
            async move {
                let records = pool.records().await;
                pool.live_count().await == 2
                    && records.iter().all(|r| r.state == WorkerState::Running)
            }
        })
        .await;

        // Planned restarts are not counted against the restart budget.
        assert_eq!(h.pool.stats().await.restarts, 0);
        h.pool.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn restart_budget_exhaustion_stops_slot() {
        let h = harness(1, |s| s.max_restarts = 1, Duration::from_secs(1));
        h.pool.start().await.unwrap();

        h.pool.terminate("worker-0").await.unwrap();
        let pool = h.pool.clone();
        wait_for(|| {
            let pool = pool.clone();
            async move { pool.stats().await.restarts == 1 && pool.live_count().await == 1 }
        })
        .await;

        h.pool.terminate("worker-0").await.unwrap();
        let pool = h.pool.clone();
        wait_for(|| {
            let pool = pool.clone();
            async move { pool.records().await[0].state == WorkerState::Stopped }
        })
        .await;
        assert_eq!(h.pool.live_count().await, 0);

        h.pool.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_worker_not_found() {
        let h = harness(1, |_| {}, Duration::from_secs(1));
        assert!(matches!(
            h.pool.terminate("worker-9").await,
            Err(WorkerError::NotFound { .. })
        ));
        assert!(matches!(h.pool.restart_all().await, Err(WorkerError::NotRunning)));
    }
}
