//! # Tabula - schema-on-demand record store
//!
//! Tabula lets callers define record models at runtime (a name plus an
//! ordered set of typed fields, possibly referencing other models),
//! materializes SQLite tables for them, and then stores and retrieves
//! typed records against those tables, resolving foreign-key
//! relationships automatically.
//!
//! Tabula provides:
//! - A closed field type system (Integer, Text, Real, Blob) with value coercion
//! - Model descriptors synthesized into CREATE TABLE / INSERT / SELECT statements
//! - A per-database storage engine with recursive foreign-key write and read expansion
//! - A schema registry persisted in a `_models` metadata table for restart durability
//! - An async dispatcher fanning blocking storage calls out to a bounded worker pool
//! - An HTTP facade for schema submission, storage and retrieval

pub mod config;
pub mod dispatcher;
pub mod field;
pub mod model;
pub mod server;
pub mod storage;

// Re-exports for convenient access
pub use dispatcher::Dispatcher;
pub use field::{FieldKind, FieldSpec, FieldValue};
pub use model::{ModelDescriptor, Record};
pub use storage::{ConnectionPool, StorageEngine};

/// Result type alias for Tabula operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Tabula operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Unknown field '{1}' on model '{0}'")]
    UnknownField(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
