//! Per-database storage: engine, schema metadata and connection pooling

pub mod engine;
pub mod pool;
pub mod schema;

pub use engine::StorageEngine;
pub use pool::ConnectionPool;
