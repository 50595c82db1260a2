//! Attachment filter: size and type policy applied before anything becomes a task.

use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::ingest::model::{AttachmentCandidate, SourceItem};

/// Filter policy.
#[derive(Debug, Clone)]
pub struct FilterPolicy {
    /// Lowercase extensions with leading dot. Empty allows any extension.
    pub allowed_extensions: Vec<String>,
    /// Largest accepted attachment in bytes.
    pub max_size_bytes: u64,
}

/// Applies a [`FilterPolicy`] to the attachments of a [`SourceItem`].
#[derive(Debug, Clone)]
pub struct AttachmentFilter {
    policy: FilterPolicy,
}

impl AttachmentFilter {
    pub fn new(policy: FilterPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FilterPolicy {
        &self.policy
    }

    /// Check one attachment against the policy.
    pub fn validate(&self, attachment: &AttachmentCandidate) -> Result<(), ValidationError> {
        if attachment.filename.trim().is_empty() {
            return Err(ValidationError::EmptyFilename);
        }

        if !self.policy.allowed_extensions.is_empty() {
            let extension = attachment.extension().unwrap_or_default();
            if !self.policy.allowed_extensions.contains(&extension) {
                return Err(ValidationError::ExtensionNotAllowed {
                    filename: attachment.filename.clone(),
                    extension,
                });
            }
        }

        // Trust neither the declared size nor the payload alone.
        let size = attachment.size_bytes.max(attachment.content.len() as u64);
        if size > self.policy.max_size_bytes {
            return Err(ValidationError::TooLarge {
                filename: attachment.filename.clone(),
                size,
                max: self.policy.max_size_bytes,
            });
        }

        if attachment.content.is_empty() {
            return Err(ValidationError::EmptyContent {
                filename: attachment.filename.clone(),
            });
        }

        Ok(())
    }

    /// Surviving attachments of `item`, in source order. Every drop is logged;
    /// an item with nothing left is still a successful (metadata-only) ingest.
    pub fn filter(&self, item: &SourceItem) -> Vec<AttachmentCandidate> {
        let kept: Vec<AttachmentCandidate> = item
            .attachments
            .iter()
            .filter(|attachment| match self.validate(attachment) {
                Ok(()) => true,
                Err(reason) => {
                    warn!(
                        item_id = %item.id,
                        attachment_id = %attachment.id,
                        %reason,
                        "Dropping attachment"
                    );
                    false
                }
            })
            .cloned()
            .collect();

        debug!(
            item_id = %item.id,
            kept = kept.len(),
            total = item.attachments.len(),
            "Filtered attachments"
        );
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::model::SenderIdentity;

    fn filter(max: u64) -> AttachmentFilter {
        AttachmentFilter::new(FilterPolicy {
            allowed_extensions: vec![".pdf".into(), ".xlsx".into()],
            max_size_bytes: max,
        })
    }

    fn attachment(id: &str, name: &str, len: usize) -> AttachmentCandidate {
        AttachmentCandidate::new(id, name, "", vec![b'x'; len])
    }

    #[test]
    fn oversize_dropped_siblings_kept() {
        let item = SourceItem::new("m1", "Invoices", SenderIdentity::default())
            .with_attachment(attachment("a1", "small.pdf", 10))
            .with_attachment(attachment("a2", "huge.pdf", 101))
            .with_attachment(attachment("a3", "sheet.XLSX", 100));

        let kept = filter(100).filter(&item);
        let ids: Vec<&str> = kept.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "a3"]);
    }

    #[test]
    fn extension_outside_allow_set() {
        let err = filter(100).validate(&attachment("a1", "notes.txt", 5)).unwrap_err();
        assert_eq!(
            err,
            ValidationError::ExtensionNotAllowed {
                filename: "notes.txt".into(),
                extension: ".txt".into()
            }
        );
        assert!(filter(100).validate(&attachment("a2", "noext", 5)).is_err());
    }

    #[test]
    fn declared_size_counts_even_if_content_small() {
        let mut a = attachment("a1", "doc.pdf", 5);
        a.size_bytes = 1_000;
        assert!(matches!(
            filter(100).validate(&a),
            Err(ValidationError::TooLarge { size: 1_000, .. })
        ));
    }

    #[test]
    fn empty_name_and_content_rejected() {
        assert_eq!(
            filter(100).validate(&attachment("a1", "  ", 5)),
            Err(ValidationError::EmptyFilename)
        );
        assert!(matches!(
            filter(100).validate(&attachment("a2", "empty.pdf", 0)),
            Err(ValidationError::EmptyContent { .. })
        ));
    }

    #[test]
    fn empty_allow_set_accepts_any_extension() {
        let f = AttachmentFilter::new(FilterPolicy {
            allowed_extensions: vec![],
            max_size_bytes: 100,
        });
        assert!(f.validate(&attachment("a1", "anything.weird", 5)).is_ok());
    }

    #[test]
    fn item_without_survivors_yields_empty() {
        let item = SourceItem::new("m1", "no files", SenderIdentity::default())
            .with_attachment(attachment("a1", "x.exe", 5));
        assert!(filter(100).filter(&item).is_empty());
    }
}
