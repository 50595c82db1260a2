//! Task: one unit of queued work, and its wire record.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::ingest::model::{AttachmentCandidate, SourceItem};

/// Namespace for deterministic task ids.
const TASK_NAMESPACE: Uuid = Uuid::from_u128(0x5f1c_2a0e_8d4b_4c7e_9a61_3b2d_7e40_c915);

/// Derive the task id for an attachment of a source item.
///
/// Pure function of its inputs, so re-ingesting the same item produces the
/// same id and result storage stays idempotent.
pub fn derive_task_id(source_item_id: &str, attachment_id: &str) -> String {
    // Unit separator keeps ("ab", "c") and ("a", "bc") apart.
    let name = format!("{source_item_id}\u{1f}{attachment_id}");
    Uuid::new_v5(&TASK_NAMESPACE, name.as_bytes()).to_string()
}

/// A decoded task, owned by exactly one worker once popped.
#[derive(Clone, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub source_item_id: String,
    pub item_subject: String,
    pub sender_display: String,
    pub sender_address: String,
    pub item_content_snippet: String,
    pub item_received_at: DateTime<Utc>,
    pub attachment_id: String,
    pub attachment_filename: String,
    pub attachment_content: Vec<u8>,
    pub attachment_mime_type: String,
    pub attachment_size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Snapshot an item's metadata together with one of its attachments.
    pub fn from_attachment(item: &SourceItem, attachment: &AttachmentCandidate) -> Self {
        Self {
            task_id: derive_task_id(&item.id, &attachment.id),
            source_item_id: item.id.clone(),
            item_subject: item.subject.clone(),
            sender_display: item.sender.display.clone(),
            sender_address: item.sender.address.clone(),
            item_content_snippet: item.snippet.clone(),
            item_received_at: item.received_at,
            attachment_id: attachment.id.clone(),
            attachment_filename: attachment.filename.clone(),
            attachment_content: attachment.content.clone(),
            attachment_mime_type: attachment.mime_type.clone(),
            attachment_size_bytes: attachment.size_bytes,
            created_at: Utc::now(),
        }
    }

    /// Serialize to the queue wire format.
    pub fn encode(&self) -> Result<String, QueueError> {
        let record = TaskRecord {
            task_id: self.task_id.clone(),
            source_item_id: self.source_item_id.clone(),
            item_subject: self.item_subject.clone(),
            sender_display: self.sender_display.clone(),
            sender_address: self.sender_address.clone(),
            item_content_snippet: self.item_content_snippet.clone(),
            item_received_at: self.item_received_at,
            attachment_id: self.attachment_id.clone(),
            attachment_filename: self.attachment_filename.clone(),
            attachment_content_b64: BASE64.encode(&self.attachment_content),
            attachment_mime_type: self.attachment_mime_type.clone(),
            attachment_size_bytes: self.attachment_size_bytes,
            created_at: self.created_at,
        };
        serde_json::to_string(&record).map_err(|e| QueueError::Encode(e.to_string()))
    }

    /// Parse a wire record into a task.
    pub fn decode(raw: &str) -> Result<Self, QueueError> {
        TaskRecord::parse(raw)?.into_task()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("task_id", &self.task_id)
            .field("source_item_id", &self.source_item_id)
            .field("attachment_filename", &self.attachment_filename)
            .field("attachment_mime_type", &self.attachment_mime_type)
            .field("attachment_size_bytes", &self.attachment_size_bytes)
            .finish_non_exhaustive()
    }
}

/// Serialized form stored in the queue.
///
/// Decoding is two-phase: the JSON envelope first, then the base64 payload,
/// so a worker still knows the `task_id` when only the content is corrupt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub source_item_id: String,
    pub item_subject: String,
    pub sender_display: String,
    pub sender_address: String,
    pub item_content_snippet: String,
    pub item_received_at: DateTime<Utc>,
    pub attachment_id: String,
    pub attachment_filename: String,
    pub attachment_content_b64: String,
    pub attachment_mime_type: String,
    pub attachment_size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn parse(raw: &str) -> Result<Self, QueueError> {
        serde_json::from_str(raw).map_err(|e| QueueError::Decode(e.to_string()))
    }

    pub fn into_task(self) -> Result<Task, QueueError> {
        let content = BASE64
            .decode(self.attachment_content_b64.as_bytes())
            .map_err(|e| QueueError::Decode(format!("task {}: attachment content: {e}", self.task_id)))?;
        Ok(Task {
            task_id: self.task_id,
            source_item_id: self.source_item_id,
            item_subject: self.item_subject,
            sender_display: self.sender_display,
            sender_address: self.sender_address,
            item_content_snippet: self.item_content_snippet,
            item_received_at: self.item_received_at,
            attachment_id: self.attachment_id,
            attachment_filename: self.attachment_filename,
            attachment_content: content,
            attachment_mime_type: self.attachment_mime_type,
            attachment_size_bytes: self.attachment_size_bytes,
            created_at: self.created_at,
        })
    }

    /// Copy with the content replaced by `<N characters>`.
    pub fn redacted(&self) -> Self {
        Self {
            attachment_content_b64: format!("<{} characters>", self.attachment_content_b64.len()),
            ..self.clone()
        }
    }
}

/// Preview of a raw queue record that never exposes attachment content.
pub fn redact_record(raw: &str) -> serde_json::Value {
    match TaskRecord::parse(raw) {
        Ok(record) => serde_json::to_value(record.redacted())
            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() })),
        Err(_) => serde_json::json!({
            "unparseable": format!("<{} characters>", raw.len()),
        }),
    }
}
