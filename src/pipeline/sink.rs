//! Result sinks: bounded in-memory feed and fan-out.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::Error;
use crate::pipeline::types::{ProcessingResult, ResultSink};

/// Keeps the most recent results in memory, one entry per task id.
pub struct MemoryResultSink {
    capacity: usize,
    results: RwLock<VecDeque<ProcessingResult>>,
}

impl MemoryResultSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            results: RwLock::new(VecDeque::new()),
        }
    }

    /// Every retained result, oldest first.
    pub async fn all(&self) -> Vec<ProcessingResult> {
        self.results.read().await.iter().cloned().collect()
    }

    pub async fn get(&self, task_id: &str) -> Option<ProcessingResult> {
        self.results
            .read()
            .await
            .iter()
            .find(|r| r.task_id == task_id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn record(&self, result: &ProcessingResult) -> Result<(), Error> {
        let mut results = self.results.write().await;
        // Same task id replaces the earlier entry.
        results.retain(|r| r.task_id != result.task_id);
        results.push_back(result.clone());
        while results.len() > self.capacity {
            results.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ProcessingResult>, Error> {
        Ok(self
            .results
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Records into every inner sink. `recent` reads from the first.
pub struct CompositeSink {
    sinks: Vec<Arc<dyn ResultSink>>,
}

impl CompositeSink {
    pub fn new(sinks: Vec<Arc<dyn ResultSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl ResultSink for CompositeSink {
    async fn record(&self, result: &ProcessingResult) -> Result<(), Error> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.record(result).await {
                warn!(task_id = %result.task_id, error = %e, "Result sink failed");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ProcessingResult>, Error> {
        match self.sinks.first() {
            Some(sink) => sink.recent(limit).await,
            None => Ok(Vec::new()),
        }
    }
}
