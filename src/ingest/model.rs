//! Ingestion data model: cursor, source items, attachment candidates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque position in a source's change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

impl SyncCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            issued_at: Utc::now(),
        }
    }
}

/// Who sent an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderIdentity {
    /// Human-readable name, may be empty.
    pub display: String,
    /// Mail address (or uploader identity for direct uploads).
    pub address: String,
}

impl SenderIdentity {
    pub fn new(display: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            display: display.into(),
            address: address.into(),
        }
    }
}

/// One ingested message or upload.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceItem {
    /// Source-native id (mail message id, or content-derived id for uploads).
    pub id: String,
    pub subject: String,
    pub sender: SenderIdentity,
    /// Body text, truncated to [`SNIPPET_MAX_CHARS`].
    pub snippet: String,
    pub received_at: DateTime<Utc>,
    /// Candidate attachments in source order.
    pub attachments: Vec<AttachmentCandidate>,
}

/// Longest body snippet carried along with every task.
pub const SNIPPET_MAX_CHARS: usize = 2000;

impl SourceItem {
    pub fn new(id: impl Into<String>, subject: impl Into<String>, sender: SenderIdentity) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            sender,
            snippet: String::new(),
            received_at: Utc::now(),
            attachments: Vec::new(),
        }
    }

    pub fn with_snippet(mut self, body: &str) -> Self {
        self.snippet = truncate_chars(body, SNIPPET_MAX_CHARS);
        self
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentCandidate) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// A file attached to a [`SourceItem`], before filtering.
#[derive(Clone, PartialEq)]
pub struct AttachmentCandidate {
    /// Source-native attachment id; stable across re-fetches of the same item.
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub content: Vec<u8>,
}

impl AttachmentCandidate {
    /// Build a candidate. An empty MIME type is replaced by a guess from the
    /// filename extension.
    pub fn new(
        id: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        content: Vec<u8>,
    ) -> Self {
        let filename = filename.into();
        let mut mime_type = mime_type.into();
        if mime_type.trim().is_empty() {
            mime_type = guess_mime_type(&filename).to_string();
        }
        Self {
            id: id.into(),
            size_bytes: content.len() as u64,
            filename,
            mime_type,
            content,
        }
    }

    /// Lowercase extension including the dot, e.g. `.pdf`.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.filename)
    }
}

// Content bytes are not useful in debug output.
impl std::fmt::Debug for AttachmentCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentCandidate")
            .field("id", &self.id)
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

/// Lowercase extension of a filename including the dot.
pub fn extension_of(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}

/// MIME type for common attachment extensions, `application/octet-stream` otherwise.
pub fn guess_mime_type(filename: &str) -> &'static str {
    match extension_of(filename).as_deref() {
        Some(".pdf") => "application/pdf",
        Some(".docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some(".xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some(".xls") => "application/vnd.ms-excel",
        Some(".csv") => "text/csv",
        Some(".txt") => "text/plain",
        Some(".json") => "application/json",
        Some(".jpg") | Some(".jpeg") => "image/jpeg",
        Some(".png") => "image/png",
        Some(".tif") | Some(".tiff") => "image/tiff",
        Some(".bmp") => "image/bmp",
        Some(".eml") => "message/rfc822",
        _ => "application/octet-stream",
    }
}

/// Truncate to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
