//! Persistence layer: libSQL-backed queue, cursors and results.

pub mod libsql_backend;
pub mod migrations;

pub use libsql_backend::{LibSqlBackend, LibSqlCursorStore, LibSqlTaskQueue};
