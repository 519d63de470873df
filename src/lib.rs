//! routed-db
//!
//! Multi-engine SQL access with scoped sessions. Statements are routed to a
//! named engine by call-site hints, table bind keys and read/write intent, so
//! one application can spread tables over several databases and send reads to
//! a replica while writes go to the primary.

pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod models;
pub mod orm;

pub use config::{Config, EngineOptions, SessionOptions, SessionOptionsUpdate};
pub use database::{Database, DatabaseBuilder, SchemaOptions};
pub use error::{DbError, DbResult};
pub use orm::{BindHint, Metadata, Model, Query, RoutedSession, ScopeKey, SessionInfo};
