//! Ordered processor registry and the extraction pipeline built on it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::PipelineError;
use crate::ingest::model::truncate_chars;
use crate::pipeline::types::{ItemContext, PipelineOutput, ProcessingPipeline};

/// Content pulled out of an attachment by a [`Processor`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedContent {
    pub text: Option<String>,
    pub metadata: serde_json::Value,
}

/// A per-format extractor. CPU-bound; runs on the blocking pool.
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn can_handle(&self, mime_type: &str) -> bool;

    fn process(&self, bytes: &[u8]) -> Result<ExtractedContent, PipelineError>;
}

/// Registry of processors, consulted in registration order.
pub struct ProcessorRegistry {
    processors: RwLock<Vec<Arc<dyn Processor>>>,
}

impl ProcessorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            processors: RwLock::new(Vec::new()),
        }
    }

    /// Registry holding the plain-text processor and the metadata-only fallback.
    pub fn with_builtins() -> Self {
        Self {
            processors: RwLock::new(vec![
                Arc::new(PlainTextProcessor) as Arc<dyn Processor>,
                Arc::new(MetadataOnlyProcessor),
            ]),
        }
    }

    /// Append a processor. A processor with the same name is replaced in place.
    pub async fn register(&self, processor: Arc<dyn Processor>) {
        let mut processors = self.processors.write().await;
        if let Some(slot) = processors.iter_mut().find(|p| p.name() == processor.name()) {
            tracing::debug!(processor = processor.name(), "Replacing processor");
            *slot = processor;
        } else {
            tracing::debug!("Registered processor: {}", processor.name());
            processors.push(processor);
        }
    }

    /// Insert a processor ahead of all others.
    pub async fn register_first(&self, processor: Arc<dyn Processor>) {
        let mut processors = self.processors.write().await;
        processors.retain(|p| p.name() != processor.name());
        processors.insert(0, processor);
    }

    /// First processor that accepts `mime_type`.
    pub async fn find(&self, mime_type: &str) -> Option<Arc<dyn Processor>> {
        self.processors
            .read()
            .await
            .iter()
            .find(|p| p.can_handle(mime_type))
            .cloned()
    }

    /// Processor names in consultation order.
    pub async fn list(&self) -> Vec<String> {
        self.processors
            .read()
            .await
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Pipeline ────────────────────────────────────────────────────────

/// [`ProcessingPipeline`] that hands each attachment to the first matching
/// processor in a [`ProcessorRegistry`].
pub struct ExtractionPipeline {
    registry: Arc<ProcessorRegistry>,
}

impl ExtractionPipeline {
    pub fn new(registry: Arc<ProcessorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }
}

#[async_trait]
impl ProcessingPipeline for ExtractionPipeline {
    fn name(&self) -> &str {
        "extraction"
    }

    async fn process(
        &self,
        bytes: &[u8],
        mime_type: &str,
        context: &ItemContext,
    ) -> Result<PipelineOutput, PipelineError> {
        let processor = self
            .registry
            .find(mime_type)
            .await
            .ok_or_else(|| PipelineError::NoProcessor {
                mime_type: mime_type.to_string(),
            })?;

        let name = processor.name().to_string();
        let owned = bytes.to_vec();
        let extracted = tokio::task::spawn_blocking(move || processor.process(&owned))
            .await
            .map_err(|e| PipelineError::Failed(format!("processor {name} panicked: {e}")))??;

        Ok(PipelineOutput {
            processor: name,
            content: serde_json::json!({
                "filename": context.filename,
                "mime_type": mime_type,
                "text": extracted.text,
                "metadata": extracted.metadata,
            }),
        })
    }
}

// ── Built-in processors ─────────────────────────────────────────────

const TEXT_PREVIEW_CHARS: usize = 500;

/// Handles `text/*` and JSON: line/char counts plus a preview.
pub struct PlainTextProcessor;

impl Processor for PlainTextProcessor {
    fn name(&self) -> &str {
        "plain_text"
    }

    fn can_handle(&self, mime_type: &str) -> bool {
        let mime = mime_type.to_ascii_lowercase();
        mime.starts_with("text/") || mime == "application/json"
    }

    fn process(&self, bytes: &[u8]) -> Result<ExtractedContent, PipelineError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| PipelineError::Failed(format!("not valid UTF-8: {e}")))?;
        Ok(ExtractedContent {
            text: Some(truncate_chars(text, TEXT_PREVIEW_CHARS)),
            metadata: serde_json::json!({
                "chars": text.chars().count(),
                "lines": text.lines().count(),
            }),
        })
    }
}

/// Accepts anything; records size only.
pub struct MetadataOnlyProcessor;

impl Processor for MetadataOnlyProcessor {
    fn name(&self) -> &str {
        "metadata_only"
    }

    fn can_handle(&self, _mime_type: &str) -> bool {
        true
    }

    fn process(&self, bytes: &[u8]) -> Result<ExtractedContent, PipelineError> {
        Ok(ExtractedContent {
            text: None,
            metadata: serde_json::json!({ "bytes": bytes.len() }),
        })
    }
}
