//! Routing policy: which engine serves a statement.
//!
//! Precedence, highest first:
//! 1. a call-site bind hint that resolves to an engine name
//! 2. the bind key of the statement's table
//! 3. writes go to `"default"`
//! 4. reads go to `"default"` while the session has writes in flight, otherwise
//!    to the configured read engine (or `"default"` when there is none)

use super::metadata::{EntityId, Metadata};
use crate::config::DEFAULT_ENGINE;
use crate::db::EngineRegistry;
use crate::error::{DbError, DbResult};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// Explicit engine selection supplied at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindHint {
    /// An engine name.
    ByName(String),
    /// The bind key of a registered model type.
    ByEntityType(EntityId),
    /// The bind key of a registered table.
    ByTable(String),
}

impl BindHint {
    pub fn name(name: impl Into<String>) -> Self {
        Self::ByName(name.into())
    }

    pub fn entity<T: 'static>() -> Self {
        Self::ByEntityType(EntityId::of::<T>())
    }

    pub fn table(table: impl Into<String>) -> Self {
        Self::ByTable(table.into())
    }
}

impl std::fmt::Display for BindHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindHint::ByName(name) => write!(f, "engine '{}'", name),
            BindHint::ByEntityType(entity) => write!(f, "model {}", entity),
            BindHint::ByTable(table) => write!(f, "table '{}'", table),
        }
    }
}

/// Everything the policy looks at for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub operation: Operation,
    pub hint: Option<BindHint>,
    /// Bind key of the table the statement targets, if any
    pub entity_bind: Option<String>,
    /// Unflushed changes or open transactions exist in the session
    pub write_in_flight: bool,
}

impl RouteRequest {
    pub fn read() -> Self {
        Self {
            operation: Operation::Read,
            hint: None,
            entity_bind: None,
            write_in_flight: false,
        }
    }

    pub fn write() -> Self {
        Self {
            operation: Operation::Write,
            ..Self::read()
        }
    }

    pub fn with_hint(mut self, hint: Option<BindHint>) -> Self {
        self.hint = hint;
        self
    }

    pub fn with_entity_bind(mut self, bind_key: Option<String>) -> Self {
        self.entity_bind = bind_key;
        self
    }

    pub fn with_write_in_flight(mut self, in_flight: bool) -> Self {
        self.write_in_flight = in_flight;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    engines: HashSet<String>,
    read_engine: Option<String>,
}

impl RoutingPolicy {
    /// Build a policy over the registry's engines.
    ///
    /// Fails with a configuration error if `read_engine` is not a registered engine.
    pub fn new(registry: &EngineRegistry, read_engine: Option<String>) -> DbResult<Self> {
        Self::from_names(registry.names(), read_engine)
    }

    pub fn from_names(
        names: impl IntoIterator<Item = String>,
        read_engine: Option<String>,
    ) -> DbResult<Self> {
        let engines: HashSet<String> = names.into_iter().collect();
        if let Some(read) = &read_engine {
            if !engines.contains(read) {
                return Err(DbError::configuration(
                    format!("Read engine '{}' is not a configured engine", read),
                    "Name a read engine that appears in the database mapping",
                ));
            }
        }
        Ok(Self {
            engines,
            read_engine,
        })
    }

    pub fn read_engine(&self) -> Option<&str> {
        self.read_engine.as_deref()
    }

    /// Turn a hint into an engine name. Entity and table hints yield their bind
    /// key, or `None` when the model or table has none.
    pub fn resolve_hint(&self, hint: &BindHint, metadata: &Metadata) -> Option<String> {
        match hint {
            BindHint::ByName(name) => Some(name.clone()),
            BindHint::ByEntityType(entity) => {
                metadata.table_for(entity).and_then(|t| t.bind_key.clone())
            }
            BindHint::ByTable(table) => metadata.table(table).and_then(|t| t.bind_key.clone()),
        }
    }

    /// Select the engine name for a statement.
    pub fn route(&self, request: &RouteRequest, metadata: &Metadata) -> DbResult<String> {
        if let Some(hint) = &request.hint {
            if let Some(name) = self.resolve_hint(hint, metadata) {
                return self.known(name, || format!("bind hint ({})", hint));
            }
        }

        if let Some(bind_key) = &request.entity_bind {
            return self.known(bind_key.clone(), || "table bind key".to_string());
        }

        let engine = match request.operation {
            Operation::Write => DEFAULT_ENGINE,
            Operation::Read if request.write_in_flight => DEFAULT_ENGINE,
            Operation::Read => self.read_engine.as_deref().unwrap_or(DEFAULT_ENGINE),
        };
        Ok(engine.to_string())
    }

    fn known(&self, name: String, source: impl FnOnce() -> String) -> DbResult<String> {
        if self.engines.contains(&name) {
            Ok(name)
        } else {
            Err(DbError::unknown_engine(name, source()))
        }
    }
}
