//! Ingestion: sources, cursor, attachment filter, and the poller that ties
//! them to the queue producer.

pub mod cursor;
pub mod filter;
pub mod graph;
pub mod model;
pub mod poller;
pub mod rfc822;
pub mod source;

pub use cursor::{CursorStore, MemoryCursorStore};
pub use filter::{AttachmentFilter, FilterPolicy};
pub use graph::{ClientCredentialsProvider, CredentialProvider, GraphMailSource, StaticTokenProvider};
pub use model::{AttachmentCandidate, SenderIdentity, SourceItem, SyncCursor};
pub use poller::{Handoff, HandoffReport, PollOutcome, PollState, PollerStatus, SourcePoller};
pub use source::{MemorySource, SourceBatch, SourceClient, is_member};
