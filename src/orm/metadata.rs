//! Model base: the shared registry of table definitions.
//!
//! Typed models implement [`Model`] and register on first use. Untyped tables
//! (e.g. loaded from a JSON models file) are added with [`Metadata::add_table`].

use crate::error::{DbError, DbResult};
use crate::models::TableDef;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A row-mapped entity type.
///
/// The entity is serialized with serde; field names must match column names.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct User { id: i64, name: String }
///
/// impl Model for User {
///     fn table_def() -> TableDef {
///         TableDef::new(default_table_name::<Self>())
///             .column(ColumnDef::new("id", ColumnType::BigInt).primary_key())
///             .column(ColumnDef::new("name", ColumnType::Text).not_null())
///     }
/// }
/// ```
pub trait Model: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn table_def() -> TableDef;
}

/// Identity of a model type, usable as a routing hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityId {
    type_id: TypeId,
    name: &'static str,
}

impl EntityId {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name)
    }
}

/// Snake-cased, unqualified type name: `app::models::UserAccount` becomes `user_account`.
pub fn default_table_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);

    let mut out = String::with_capacity(short.len() + 4);
    let mut prev_lower = false;
    for ch in short.chars() {
        if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

#[derive(Debug, Default)]
struct Registry {
    tables: Vec<Arc<TableDef>>,
    by_name: HashMap<String, usize>,
    by_type: HashMap<TypeId, usize>,
}

/// Ordered table definitions keyed by table name and by model type.
#[derive(Debug, Default)]
pub struct Metadata {
    inner: RwLock<Registry>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a model type. Idempotent.
    pub fn register<T: Model>(&self) -> DbResult<Arc<TableDef>> {
        let type_id = TypeId::of::<T>();
        {
            let registry = self.read();
            if let Some(&idx) = registry.by_type.get(&type_id) {
                return Ok(Arc::clone(&registry.tables[idx]));
            }
        }

        let table = T::table_def();
        let mut registry = self.write();
        if let Some(&idx) = registry.by_type.get(&type_id) {
            return Ok(Arc::clone(&registry.tables[idx]));
        }
        let idx = Self::insert(&mut registry, table)?;
        registry.by_type.insert(type_id, idx);
        debug!(model = %std::any::type_name::<T>(), table = %registry.tables[idx].name, "Registered model");
        Ok(Arc::clone(&registry.tables[idx]))
    }

    /// Add an untyped table definition.
    ///
    /// Re-adding an identical definition is a no-op; a different definition under
    /// an existing name is a schema error.
    pub fn add_table(&self, table: TableDef) -> DbResult<Arc<TableDef>> {
        let mut registry = self.write();
        let idx = Self::insert(&mut registry, table)?;
        Ok(Arc::clone(&registry.tables[idx]))
    }

    fn insert(registry: &mut Registry, table: TableDef) -> DbResult<usize> {
        table.validate()?;
        if let Some(&idx) = registry.by_name.get(&table.name) {
            if *registry.tables[idx] == table {
                return Ok(idx);
            }
            return Err(DbError::schema(
                "A different definition is already registered under this table name",
                &table.name,
            ));
        }
        let idx = registry.tables.len();
        registry.by_name.insert(table.name.clone(), idx);
        registry.tables.push(Arc::new(table));
        Ok(idx)
    }

    pub fn table(&self, name: &str) -> Option<Arc<TableDef>> {
        let registry = self.read();
        registry
            .by_name
            .get(name)
            .map(|&idx| Arc::clone(&registry.tables[idx]))
    }

    pub fn table_for(&self, entity: &EntityId) -> Option<Arc<TableDef>> {
        let registry = self.read();
        registry
            .by_type
            .get(&entity.type_id)
            .map(|&idx| Arc::clone(&registry.tables[idx]))
    }

    /// All tables in registration order.
    pub fn tables(&self) -> Vec<Arc<TableDef>> {
        self.read().tables.clone()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.read().tables.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDef, ColumnType};
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct UserAccount {
        id: i64,
    }

    impl Model for UserAccount {
        fn table_def() -> TableDef {
            TableDef::new(default_table_name::<Self>())
                .column(ColumnDef::new("id", ColumnType::BigInt).primary_key())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Event {
        id: i64,
    }

    impl Model for Event {
        fn table_def() -> TableDef {
            TableDef::new("events")
                .column(ColumnDef::new("id", ColumnType::BigInt).primary_key())
                .bind_key("analytics")
        }
    }

    #[test]
    fn test_default_table_name() {
        assert_eq!(default_table_name::<UserAccount>(), "user_account");
        assert_eq!(default_table_name::<Event>(), "event");
        assert_eq!(default_table_name::<Vec<u8>>(), "vec");
    }

    #[test]
    fn test_register_is_idempotent() {
        let metadata = Metadata::new();
        let first = metadata.register::<UserAccount>().unwrap();
        let second = metadata.register::<UserAccount>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(metadata.len(), 1);
    }

    #[test]
    fn test_lookup_by_type_and_name() {
        let metadata = Metadata::new();
        metadata.register::<UserAccount>().unwrap();
        metadata.register::<Event>().unwrap();

        assert_eq!(metadata.table_names(), vec!["user_account", "events"]);
        let events = metadata.table_for(&EntityId::of::<Event>()).unwrap();
        assert_eq!(events.bind_key.as_deref(), Some("analytics"));
        assert!(metadata.table("user_account").is_some());
        assert!(metadata.table("missing").is_none());
    }

    #[test]
    fn test_conflicting_table_definition() {
        let metadata = Metadata::new();
        metadata.register::<Event>().unwrap();

        let same = Event::table_def();
        assert!(metadata.add_table(same).is_ok());

        let different = TableDef::new("events").column(ColumnDef::new("id", ColumnType::Text));
        assert!(matches!(
            metadata.add_table(different),
            Err(DbError::Schema { .. })
        ));
    }
}
