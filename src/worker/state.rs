//! Worker lifecycle state machine and per-slot bookkeeping.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Lifecycle state of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, no heartbeat yet.
    Starting,
    /// Heartbeating and consuming tasks.
    Running,
    /// Replacement requested or in progress.
    Restarting,
    /// Pool shut down, or restart attempts exhausted.
    Stopped,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Starting, Running) | (Starting, Restarting) | (Starting, Stopped) |
            (Running, Restarting) | (Running, Stopped) |
            (Restarting, Running) | (Restarting, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Read-only snapshot of one worker slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub state: WorkerState,
    pub last_heartbeat: DateTime<Utc>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Unplanned restarts (crash or staleness).
    pub restarts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct SlotState {
    state: WorkerState,
    /// Incremented every time a new worker instance is spawned into the slot.
    generation: u64,
    /// Instances at or below this generation have been asked to stop and
    /// must not promote the slot back to `Running`.
    retired_generation: u64,
    last_beat: Instant,
    last_beat_at: DateTime<Utc>,
    last_error: Option<String>,
}

/// One position in the pool. Survives across worker instances.
///
/// Counters are per-slot atomics; lifecycle fields sit behind a short-lived
/// mutex that is never held across an await.
#[derive(Debug)]
pub struct WorkerSlot {
    worker_id: String,
    inner: Mutex<SlotState>,
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    restarts: AtomicU32,
}

impl WorkerSlot {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            inner: Mutex::new(SlotState {
                state: WorkerState::Starting,
                generation: 0,
                retired_generation: 0,
                last_beat: Instant::now(),
                last_beat_at: Utc::now(),
                last_error: None,
            }),
            processed: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            restarts: AtomicU32::new(0),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        // State stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a fresh instance. Returns its generation and resets the
    /// heartbeat clock so the newcomer is not judged stale on arrival.
    pub fn begin_instance(&self) -> u64 {
        let mut s = self.lock();
        s.generation += 1;
        s.last_beat = Instant::now();
        s.last_beat_at = Utc::now();
        s.generation
    }

    /// Heartbeat from instance `generation`. Ignored for superseded instances.
    ///
    /// The first beat of the current instance promotes `Starting` or
    /// `Restarting` to `Running`.
    pub fn heartbeat(&self, generation: u64) -> bool {
        let mut s = self.lock();
        if generation != s.generation {
            return false;
        }
        s.last_beat = Instant::now();
        s.last_beat_at = Utc::now();
        let promote = match s.state {
            WorkerState::Starting => true,
            WorkerState::Restarting => generation > s.retired_generation,
            _ => false,
        };
        if promote {
            tracing::debug!(worker_id = %self.worker_id, generation, "Worker running");
            s.state = WorkerState::Running;
        }
        true
    }

    /// Move to `target` if the state machine allows it.
    pub fn transition_to(&self, target: WorkerState, reason: Option<&str>) -> Result<(), String> {
        let mut s = self.lock();
        if s.state == target {
            return Ok(());
        }
        if !s.state.can_transition_to(target) {
            return Err(format!(
                "Cannot transition worker {} from {} to {}",
                self.worker_id, s.state, target
            ));
        }
        tracing::debug!(
            worker_id = %self.worker_id,
            from = %s.state,
            to = %target,
            reason = reason.unwrap_or(""),
            "Worker state change"
        );
        s.state = target;
        if target == WorkerState::Restarting {
            s.retired_generation = s.generation;
        }
        Ok(())
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Time since the last accepted heartbeat.
    pub fn heartbeat_age(&self) -> Duration {
        self.lock().last_beat.elapsed()
    }

    pub fn set_error(&self, error: impl Into<String>) {
        self.lock().last_error = Some(error.into());
    }

    /// Count one finished task.
    pub fn record_outcome(&self, success: bool) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count an unplanned restart; returns the new total.
    pub fn note_restart(&self) -> u32 {
        self.restarts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> WorkerRecord {
        let s = self.lock();
        WorkerRecord {
            worker_id: self.worker_id.clone(),
            state: s.state,
            last_heartbeat: s.last_beat_at,
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            last_error: s.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_valid() {
        assert!(WorkerState::Starting.can_transition_to(WorkerState::Running));
        assert!(WorkerState::Running.can_transition_to(WorkerState::Restarting));
        assert!(WorkerState::Restarting.can_transition_to(WorkerState::Running));
        assert!(WorkerState::Running.can_transition_to(WorkerState::Stopped));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!WorkerState::Stopped.can_transition_to(WorkerState::Running));
        assert!(!WorkerState::Stopped.can_transition_to(WorkerState::Starting));
        assert!(!WorkerState::Running.can_transition_to(WorkerState::Starting));
        assert!(WorkerState::Stopped.is_terminal());
    }

    #[test]
    fn worker_state_serde() {
        let json = serde_json::to_string(&WorkerState::Restarting).unwrap();
        assert_eq!(json, "\"restarting\"");
        assert_eq!(WorkerState::Running.to_string(), "running");
    }

    #[tokio::test]
    async fn first_heartbeat_promotes_to_running() {
        let slot = WorkerSlot::new("worker-0");
        let generation = slot.begin_instance();
        assert_eq!(slot.state(), WorkerState::Starting);
        assert!(slot.heartbeat(generation));
        assert_eq!(slot.state(), WorkerState::Running);
    }

    #[tokio::test]
    async fn retired_instance_cannot_promote() {
        let slot = WorkerSlot::new("worker-0");
        let old = slot.begin_instance();
        slot.heartbeat(old);
        slot.transition_to(WorkerState::Restarting, Some("operator")).unwrap();

        // Old instance still finishing its task.
        assert!(slot.heartbeat(old));
        assert_eq!(slot.state(), WorkerState::Restarting);

        let new = slot.begin_instance();
        assert!(!slot.heartbeat(old));
        assert!(slot.heartbeat(new));
        assert_eq!(slot.state(), WorkerState::Running);
    }

    #[tokio::test]
    async fn stopped_is_terminal() {
        let slot = WorkerSlot::new("worker-0");
        let generation = slot.begin_instance();
        slot.transition_to(WorkerState::Stopped, None).unwrap();
        slot.heartbeat(generation);
        assert_eq!(slot.state(), WorkerState::Stopped);
        assert!(slot.transition_to(WorkerState::Running, None).is_err());
    }

    #[test]
    fn counters_in_snapshot() {
        let slot = WorkerSlot::new("worker-1");
        slot.record_outcome(true);
        slot.record_outcome(false);
        slot.record_outcome(true);
        assert_eq!(slot.note_restart(), 1);
        let record = slot.snapshot();
        assert_eq!(record.processed, 3);
        assert_eq!(record.succeeded, 2);
        assert_eq!(record.failed, 1);
        assert_eq!(record.restarts, 1);
    }
}
