//! Table definition models.
//!
//! A [`TableDef`] is what a model registers into the shared metadata. The same
//! shape is read from JSON model files by the CLI.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Portable column types, mapped to a concrete SQL type per dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    BigInt,
    Text,
    Real,
    Boolean,
    Blob,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            primary_key: false,
            nullable: true,
            unique: false,
        }
    }

    /// Mark this column as (part of) the primary key. Implies NOT NULL.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Engine that statements on this table are routed to by default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_key: Option<String>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            bind_key: None,
        }
    }

    /// Append a column.
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Pin this table to a named engine.
    pub fn bind_key(mut self, key: impl Into<String>) -> Self {
        self.bind_key = Some(key.into());
        self
    }

    /// Look up a column by name.
    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_key_columns(&self) -> Vec<&ColumnDef> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    /// Check the definition is usable for DDL and DML generation.
    pub fn validate(&self) -> DbResult<()> {
        if self.name.trim().is_empty() {
            return Err(DbError::schema("Table name cannot be empty", ""));
        }
        if self.columns.is_empty() {
            return Err(DbError::schema("Table has no columns", &self.name));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.trim().is_empty() {
                return Err(DbError::schema("Column name cannot be empty", &self.name));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(DbError::schema(
                    format!("Duplicate column '{}'", column.name),
                    &self.name,
                ));
            }
        }
        Ok(())
    }

    /// Primary key columns, or a schema error when the table has none.
    pub fn require_primary_key(&self) -> DbResult<Vec<&ColumnDef>> {
        let pk = self.primary_key_columns();
        if pk.is_empty() {
            return Err(DbError::schema(
                "Operation requires a primary key, but the table defines none",
                &self.name,
            ));
        }
        Ok(pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDef {
        TableDef::new("users")
            .column(ColumnDef::new("id", ColumnType::BigInt).primary_key())
            .column(ColumnDef::new("name", ColumnType::Text).not_null())
            .column(ColumnDef::new("email", ColumnType::Text).unique())
    }

    #[test]
    fn test_table_def_builder() {
        let table = users().bind_key("users_db");
        assert_eq!(table.columns.len(), 3);
        assert_eq!(table.bind_key.as_deref(), Some("users_db"));
        assert_eq!(table.primary_key_columns().len(), 1);
        assert!(!table.get_column("id").unwrap().nullable);
        assert!(table.get_column("email").unwrap().unique);
    }

    #[test]
    fn test_table_def_validate() {
        assert!(users().validate().is_ok());
        assert!(TableDef::new("empty").validate().is_err());

        let dup = users().column(ColumnDef::new("name", ColumnType::Text));
        let err = dup.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate column"));
    }

    #[test]
    fn test_require_primary_key() {
        let no_pk = TableDef::new("log").column(ColumnDef::new("line", ColumnType::Text));
        assert!(matches!(
            no_pk.require_primary_key(),
            Err(DbError::Schema { .. })
        ));
        assert_eq!(users().require_primary_key().unwrap().len(), 1);
    }

    #[test]
    fn test_table_def_from_json() {
        let json = r#"{
            "name": "events",
            "bind_key": "analytics",
            "columns": [
                {"name": "id", "type": "integer", "primary_key": true, "nullable": false},
                {"name": "payload", "type": "json"}
            ]
        }"#;
        let table: TableDef = serde_json::from_str(json).unwrap();
        assert_eq!(table.name, "events");
        assert_eq!(table.bind_key.as_deref(), Some("analytics"));
        assert_eq!(table.columns[1].column_type, ColumnType::Json);
        assert!(table.columns[1].nullable);
    }
}
