//! Message source contract and the in-memory source.

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::error::SourceError;
use crate::ingest::model::{SourceItem, SyncCursor};

/// One successful poll: the new items plus the cursor to persist once they
/// have been handed off.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub items: Vec<SourceItem>,
    pub next_cursor: SyncCursor,
}

/// An external message source with delta semantics.
///
/// `poll(None)` returns every item passing the membership filter (baseline
/// sync). `poll(Some(c))` returns only items created or changed since `c`.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Source name used in logs and errors.
    fn name(&self) -> &str;

    async fn poll(&self, cursor: Option<&SyncCursor>) -> Result<SourceBatch, SourceError>;
}

/// Check if a sender address passes the membership filter.
///
/// - Empty list → everyone
/// - `*` in list → everyone
/// - `@domain.com` or `domain.com` → domain match
/// - `user@domain.com` → exact address match
pub fn is_member(membership: &[String], address: &str) -> bool {
    if membership.is_empty() || membership.iter().any(|m| m == "*") {
        return true;
    }
    let address_lower = address.to_lowercase();
    membership.iter().any(|m| {
        if m.starts_with('@') {
            address_lower.ends_with(&m.to_lowercase())
        } else if m.contains('@') {
            m.eq_ignore_ascii_case(address)
        } else {
            address_lower.ends_with(&format!("@{}", m.to_lowercase()))
        }
    })
}

/// In-memory source backed by an append-only change log.
///
/// Cursor tokens have the form `seq:<n>`, meaning "the first n log entries
/// have been seen". Useful for tests, demos, and feeding items from code.
pub struct MemorySource {
    name: String,
    membership: Vec<String>,
    log: RwLock<Vec<SourceItem>>,
    /// Errors to return from upcoming polls, in order.
    scripted_failures: Mutex<Vec<SourceError>>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, membership: Vec<String>) -> Self {
        Self {
            name: name.into(),
            membership,
            log: RwLock::new(Vec::new()),
            scripted_failures: Mutex::new(Vec::new()),
        }
    }

    /// Append an item to the change log.
    pub async fn push(&self, item: SourceItem) {
        self.log.write().await.push(item);
    }

    /// Make the next poll fail with `error`.
    pub async fn fail_next(&self, error: SourceError) {
        self.scripted_failures.lock().await.push(error);
    }

    fn parse_token(&self, cursor: &SyncCursor) -> Result<usize, SourceError> {
        cursor
            .token
            .strip_prefix("seq:")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| SourceError::Transient {
                source_name: self.name.clone(),
                reason: format!("unrecognised cursor token '{}'", cursor.token),
            })
    }
}

#[async_trait]
impl SourceClient for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn poll(&self, cursor: Option<&SyncCursor>) -> Result<SourceBatch, SourceError> {
        {
            let mut failures = self.scripted_failures.lock().await;
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }

        let start = match cursor {
            Some(c) => self.parse_token(c)?,
            None => 0,
        };

        let log = self.log.read().await;
        let items = log
            .iter()
            .skip(start)
            .filter(|item| is_member(&self.membership, &item.sender.address))
            .cloned()
            .collect();

        Ok(SourceBatch {
            items,
            next_cursor: SyncCursor::new(format!("seq:{}", log.len())),
        })
    }
}
