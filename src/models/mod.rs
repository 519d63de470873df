//! Data models for routed-db.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{DatabaseType, EngineConfig, EngineConfigError, EngineInfo, mask_credentials};
pub use query::{ExecuteResult, JsonRow, QueryParam, QueryResult};
pub use schema::{ColumnDef, ColumnType, TableDef};
