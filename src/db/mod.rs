//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Named engines and their connection pools
//! - Statement execution on pools and open transactions
//! - Per-dialect SQL generation
//! - Row decoding into JSON maps
//! - Database dispatch macros for reducing code duplication

pub mod executor;
#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod sql;
pub mod transaction;
pub mod types;

pub use executor::{QueryExecutor, Target};
pub use pool::{DbPool, Engine, EngineRegistry};
pub use transaction::DbTransaction;
