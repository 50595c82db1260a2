//! Attachment intake: mail and upload ingestion into a bounded task queue,
//! drained by a supervised worker pool.

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod queue;
pub mod service;
pub mod store;
pub mod worker;
