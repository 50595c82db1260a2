//! Read-only views over a task queue: sampled stats, reachability, lookup.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::error::QueueError;
use crate::ingest::model::extension_of;
use crate::queue::store::TaskQueue;
use crate::queue::task::TaskRecord;

/// Records sampled from the head when estimating sizes and file types.
pub const STATS_SAMPLE: usize = 10;

/// Bucket for filenames without an extension.
const NO_EXTENSION: &str = "(none)";

/// Queue statistics estimated from a head sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub queue_length: usize,
    pub capacity: usize,
    /// Records that were sampled and decoded.
    pub sample_size: usize,
    pub avg_attachment_size: f64,
    /// `avg_attachment_size * queue_length`.
    pub estimated_total_size: f64,
    /// Lowercase extension (with dot) → count within the sample.
    pub file_type_distribution: BTreeMap<String, usize>,
    /// Length as a percentage of capacity.
    pub utilization_percent: f64,
}

/// Sample the head of `queue` and summarise it.
pub async fn queue_stats(queue: &dyn TaskQueue, capacity: usize) -> Result<QueueStats, QueueError> {
    let queue_length = queue.length().await?;
    let sample = queue.peek(STATS_SAMPLE.min(queue_length)).await?;

    let mut sampled = 0usize;
    let mut total_size = 0u64;
    let mut file_types = BTreeMap::new();
    for raw in &sample {
        let record = match TaskRecord::parse(raw) {
            Ok(record) => record,
            Err(e) => {
                warn!(queue = %queue.name(), error = %e, "Skipping undecodable record in stats sample");
                continue;
            }
        };
        sampled += 1;
        total_size = total_size.saturating_add(record.attachment_size_bytes);
        let ext = extension_of(&record.attachment_filename).unwrap_or_else(|| NO_EXTENSION.to_string());
        *file_types.entry(ext).or_insert(0) += 1;
    }

    let avg_attachment_size = if sampled == 0 {
        0.0
    } else {
        total_size as f64 / sampled as f64
    };
    let utilization_percent = if capacity == 0 {
        0.0
    } else {
        queue_length as f64 / capacity as f64 * 100.0
    };

    Ok(QueueStats {
        queue_name: queue.name().to_string(),
        queue_length,
        capacity,
        sample_size: sampled,
        avg_attachment_size,
        estimated_total_size: avg_attachment_size * queue_length as f64,
        file_type_distribution: file_types,
        utilization_percent,
    })
}

/// Whether the queue store answers.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub queue_name: String,
    pub reachable: bool,
    pub queue_length: Option<usize>,
    pub errors: Vec<String>,
}

impl QueueHealth {
    pub fn is_healthy(&self) -> bool {
        self.reachable
    }
}

pub async fn health_check(queue: &dyn TaskQueue) -> QueueHealth {
    match queue.length().await {
        Ok(length) => QueueHealth {
            queue_name: queue.name().to_string(),
            reachable: true,
            queue_length: Some(length),
            errors: Vec::new(),
        },
        Err(e) => {
            warn!(queue = %queue.name(), error = %e, "Queue health check failed");
            QueueHealth {
                queue_name: queue.name().to_string(),
                reachable: false,
                queue_length: None,
                errors: vec![e.to_string()],
            }
        }
    }
}

/// Queued task with this id, decoded but still in the queue.
pub async fn find_task(queue: &dyn TaskQueue, task_id: &str) -> Result<Option<TaskRecord>, QueueError> {
    match queue.find(task_id).await? {
        Some(raw) => TaskRecord::parse(&raw).map(Some),
        None => Ok(None),
    }
}
