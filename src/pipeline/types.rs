//! Shared types for the processing collaborator and result sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, PipelineError};
use crate::queue::task::Task;

// ── Item context ────────────────────────────────────────────────────

/// Metadata of the owning item, passed to the pipeline alongside the bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemContext {
    pub task_id: String,
    pub source_item_id: String,
    pub subject: String,
    pub sender_display: String,
    pub sender_address: String,
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    pub filename: String,
}

impl ItemContext {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            source_item_id: task.source_item_id.clone(),
            subject: task.item_subject.clone(),
            sender_display: task.sender_display.clone(),
            sender_address: task.sender_address.clone(),
            snippet: task.item_content_snippet.clone(),
            received_at: task.item_received_at,
            filename: task.attachment_filename.clone(),
        }
    }
}

// ── Processing collaborator ─────────────────────────────────────────

/// What the pipeline produced for one attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    /// Name of the processor that handled the attachment.
    pub processor: String,
    pub content: serde_json::Value,
}

/// Content extraction and downstream interpretation, injected into workers.
#[async_trait]
pub trait ProcessingPipeline: Send + Sync {
    fn name(&self) -> &str;

    async fn process(
        &self,
        bytes: &[u8],
        mime_type: &str,
        context: &ItemContext,
    ) -> Result<PipelineOutput, PipelineError>;
}

// ── Results ─────────────────────────────────────────────────────────

/// Terminal outcome of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed,
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// One task's terminal record, handed to the [`ResultSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub task_id: String,
    /// Worker that handled the task; `None` for direct (in-process fallback) runs.
    pub worker_id: Option<String>,
    pub outcome: Outcome,
    pub attempts: u32,
    pub error: Option<String>,
    pub output: Option<PipelineOutput>,
    pub completed_at: DateTime<Utc>,
}

impl ProcessingResult {
    pub fn success(task_id: impl Into<String>, attempts: u32, output: PipelineOutput) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: None,
            outcome: Outcome::Success,
            attempts,
            error: None,
            output: Some(output),
            completed_at: Utc::now(),
        }
    }

    pub fn failure(
        task_id: impl Into<String>,
        outcome: Outcome,
        attempts: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: None,
            outcome,
            attempts,
            error: Some(error.into()),
            output: None,
            completed_at: Utc::now(),
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Where terminal results go (persistence, dashboards).
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(&self, result: &ProcessingResult) -> Result<(), Error>;

    /// Most recent results, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<ProcessingResult>, Error>;
}
