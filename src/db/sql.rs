//! SQL text generation.
//!
//! Builds the single-table statements the session and schema operations need,
//! adapted per dialect: identifier quoting, placeholders (`?` or `$n`), column
//! types and the LIMIT/OFFSET form.

use crate::models::{ColumnDef, ColumnType, DatabaseType, QueryParam, TableDef};

/// An equality filter on one column. A null value renders as `IS NULL`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub value: QueryParam,
}

/// An ORDER BY term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// Clauses of a generated SELECT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectSpec {
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectSpec {
    /// Parameters in placeholder order.
    pub fn params(&self) -> Vec<QueryParam> {
        self.filters
            .iter()
            .filter(|f| !f.value.is_null())
            .map(|f| f.value.clone())
            .collect()
    }
}

/// Quote an identifier for the dialect, doubling embedded quote characters.
pub fn quote_ident(db: DatabaseType, ident: &str) -> String {
    match db {
        DatabaseType::MySQL => format!("`{}`", ident.replace('`', "``")),
        DatabaseType::PostgreSQL | DatabaseType::SQLite => {
            format!("\"{}\"", ident.replace('"', "\"\""))
        }
    }
}

/// Placeholder for the n-th (1-based) parameter.
pub fn placeholder(db: DatabaseType, n: usize) -> String {
    match db {
        DatabaseType::PostgreSQL => format!("${}", n),
        DatabaseType::MySQL | DatabaseType::SQLite => "?".to_string(),
    }
}

/// Concrete SQL type for a portable column type.
pub fn column_type_sql(db: DatabaseType, column: &ColumnDef) -> &'static str {
    match (db, column.column_type) {
        (DatabaseType::SQLite, ColumnType::Integer | ColumnType::BigInt) => "INTEGER",
        (DatabaseType::SQLite, ColumnType::Text | ColumnType::Json) => "TEXT",
        (DatabaseType::SQLite, ColumnType::Real) => "REAL",
        (DatabaseType::SQLite, ColumnType::Boolean) => "BOOLEAN",
        (DatabaseType::SQLite, ColumnType::Blob) => "BLOB",

        (DatabaseType::PostgreSQL, ColumnType::Integer) => "INTEGER",
        (DatabaseType::PostgreSQL, ColumnType::BigInt) => "BIGINT",
        (DatabaseType::PostgreSQL, ColumnType::Text) => "TEXT",
        (DatabaseType::PostgreSQL, ColumnType::Real) => "DOUBLE PRECISION",
        (DatabaseType::PostgreSQL, ColumnType::Boolean) => "BOOLEAN",
        (DatabaseType::PostgreSQL, ColumnType::Blob) => "BYTEA",
        (DatabaseType::PostgreSQL, ColumnType::Json) => "JSONB",

        (DatabaseType::MySQL, ColumnType::Integer) => "INT",
        (DatabaseType::MySQL, ColumnType::BigInt) => "BIGINT",
        // MySQL cannot index TEXT without a prefix length
        (DatabaseType::MySQL, ColumnType::Text) if column.primary_key || column.unique => {
            "VARCHAR(255)"
        }
        (DatabaseType::MySQL, ColumnType::Text) => "TEXT",
        (DatabaseType::MySQL, ColumnType::Real) => "DOUBLE",
        (DatabaseType::MySQL, ColumnType::Boolean) => "BOOLEAN",
        (DatabaseType::MySQL, ColumnType::Blob) => "LONGBLOB",
        (DatabaseType::MySQL, ColumnType::Json) => "JSON",
    }
}

pub fn create_table(db: DatabaseType, table: &TableDef, checkfirst: bool) -> String {
    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quote_ident(db, &c.name), column_type_sql(db, c));
            if !c.nullable {
                def.push_str(" NOT NULL");
            }
            if c.unique && !c.primary_key {
                def.push_str(" UNIQUE");
            }
            def
        })
        .collect();

    let pk = table.primary_key_columns();
    if !pk.is_empty() {
        let cols: Vec<String> = pk.iter().map(|c| quote_ident(db, &c.name)).collect();
        parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
    }

    format!(
        "CREATE TABLE {}{} ({})",
        if checkfirst { "IF NOT EXISTS " } else { "" },
        quote_ident(db, &table.name),
        parts.join(", ")
    )
}

pub fn drop_table(db: DatabaseType, table: &TableDef, checkfirst: bool) -> String {
    format!(
        "DROP TABLE {}{}",
        if checkfirst { "IF EXISTS " } else { "" },
        quote_ident(db, &table.name)
    )
}

pub fn insert(db: DatabaseType, table: &str, columns: &[&str]) -> String {
    if columns.is_empty() {
        return match db {
            DatabaseType::MySQL => format!("INSERT INTO {} () VALUES ()", quote_ident(db, table)),
            _ => format!("INSERT INTO {} DEFAULT VALUES", quote_ident(db, table)),
        };
    }
    let cols: Vec<String> = columns.iter().map(|c| quote_ident(db, c)).collect();
    let values: Vec<String> = (1..=columns.len()).map(|n| placeholder(db, n)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(db, table),
        cols.join(", "),
        values.join(", ")
    )
}

/// UPDATE setting `set_columns`, keyed on `key_columns`. Parameters are the set
/// values followed by the key values.
pub fn update(db: DatabaseType, table: &str, set_columns: &[&str], key_columns: &[&str]) -> String {
    let assignments: Vec<String> = set_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", quote_ident(db, c), placeholder(db, i + 1)))
        .collect();
    format!(
        "UPDATE {} SET {} WHERE {}",
        quote_ident(db, table),
        assignments.join(", "),
        key_predicate(db, key_columns, set_columns.len())
    )
}

pub fn delete(db: DatabaseType, table: &str, key_columns: &[&str]) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(db, table),
        key_predicate(db, key_columns, 0)
    )
}

fn key_predicate(db: DatabaseType, key_columns: &[&str], offset: usize) -> String {
    key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = {}", quote_ident(db, c), placeholder(db, offset + i + 1)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn where_clause(db: DatabaseType, filters: &[Filter]) -> String {
    if filters.is_empty() {
        return String::new();
    }
    let mut n = 0;
    let terms: Vec<String> = filters
        .iter()
        .map(|f| {
            if f.value.is_null() {
                format!("{} IS NULL", quote_ident(db, &f.column))
            } else {
                n += 1;
                format!("{} = {}", quote_ident(db, &f.column), placeholder(db, n))
            }
        })
        .collect();
    format!(" WHERE {}", terms.join(" AND "))
}

pub fn select(db: DatabaseType, table: &TableDef, spec: &SelectSpec) -> String {
    let cols: Vec<String> = table
        .columns
        .iter()
        .map(|c| quote_ident(db, &c.name))
        .collect();
    let mut sql = format!(
        "SELECT {} FROM {}{}",
        cols.join(", "),
        quote_ident(db, &table.name),
        where_clause(db, &spec.filters)
    );

    if !spec.order_by.is_empty() {
        let terms: Vec<String> = spec
            .order_by
            .iter()
            .map(|o| {
                format!(
                    "{} {}",
                    quote_ident(db, &o.column),
                    if o.descending { "DESC" } else { "ASC" }
                )
            })
            .collect();
        sql.push_str(&format!(" ORDER BY {}", terms.join(", ")));
    }

    match (spec.limit, spec.offset) {
        (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
        (None, Some(offset)) => match db {
            // SQLite and MySQL only accept OFFSET after a LIMIT
            DatabaseType::SQLite => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            DatabaseType::MySQL => {
                sql.push_str(&format!(" LIMIT 18446744073709551615 OFFSET {}", offset))
            }
            DatabaseType::PostgreSQL => sql.push_str(&format!(" OFFSET {}", offset)),
        },
        (None, None) => {}
    }

    sql
}

pub fn count(db: DatabaseType, table: &str, filters: &[Filter]) -> String {
    format!(
        "SELECT COUNT(*) AS {} FROM {}{}",
        quote_ident(db, "count"),
        quote_ident(db, table),
        where_clause(db, filters)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDef {
        TableDef::new("users")
            .column(ColumnDef::new("id", ColumnType::BigInt).primary_key())
            .column(ColumnDef::new("name", ColumnType::Text).not_null())
            .column(ColumnDef::new("email", ColumnType::Text).unique())
            .column(ColumnDef::new("profile", ColumnType::Json))
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident(DatabaseType::SQLite, "users"), "\"users\"");
        assert_eq!(quote_ident(DatabaseType::MySQL, "users"), "`users`");
        assert_eq!(quote_ident(DatabaseType::PostgreSQL, "we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_create_table_sqlite() {
        let sql = create_table(DatabaseType::SQLite, &users(), true);
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS \"users\" (\"id\" INTEGER NOT NULL, \"name\" TEXT NOT NULL, \
             \"email\" TEXT UNIQUE, \"profile\" TEXT, PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn test_create_table_dialect_types() {
        let pg = create_table(DatabaseType::PostgreSQL, &users(), false);
        assert!(pg.starts_with("CREATE TABLE \"users\""));
        assert!(pg.contains("\"id\" BIGINT NOT NULL"));
        assert!(pg.contains("\"profile\" JSONB"));

        let my = create_table(DatabaseType::MySQL, &users(), false);
        assert!(my.contains("`email` VARCHAR(255) UNIQUE"));
        assert!(my.contains("`name` TEXT NOT NULL"));
        assert!(my.contains("`profile` JSON"));
    }

    #[test]
    fn test_drop_table() {
        assert_eq!(
            drop_table(DatabaseType::SQLite, &users(), true),
            "DROP TABLE IF EXISTS \"users\""
        );
        assert_eq!(
            drop_table(DatabaseType::MySQL, &users(), false),
            "DROP TABLE `users`"
        );
    }

    #[test]
    fn test_insert_without_columns() {
        assert_eq!(
            insert(DatabaseType::SQLite, "events", &[]),
            "INSERT INTO \"events\" DEFAULT VALUES"
        );
        assert_eq!(
            insert(DatabaseType::MySQL, "events", &[]),
            "INSERT INTO `events` () VALUES ()"
        );
    }

    #[test]
    fn test_insert_placeholders() {
        assert_eq!(
            insert(DatabaseType::SQLite, "users", &["id", "name"]),
            "INSERT INTO \"users\" (\"id\", \"name\") VALUES (?, ?)"
        );
        assert_eq!(
            insert(DatabaseType::PostgreSQL, "users", &["id", "name"]),
            "INSERT INTO \"users\" (\"id\", \"name\") VALUES ($1, $2)"
        );
    }

    #[test]
    fn test_update_and_delete() {
        assert_eq!(
            update(DatabaseType::PostgreSQL, "users", &["name", "email"], &["id"]),
            "UPDATE \"users\" SET \"name\" = $1, \"email\" = $2 WHERE \"id\" = $3"
        );
        assert_eq!(
            delete(DatabaseType::MySQL, "users", &["id"]),
            "DELETE FROM `users` WHERE `id` = ?"
        );
    }

    #[test]
    fn test_select_with_clauses() {
        let spec = SelectSpec {
            filters: vec![
                Filter {
                    column: "name".into(),
                    value: QueryParam::from("alice"),
                },
                Filter {
                    column: "email".into(),
                    value: QueryParam::Null,
                },
            ],
            order_by: vec![OrderBy {
                column: "id".into(),
                descending: true,
            }],
            limit: Some(10),
            offset: Some(20),
        };
        let sql = select(DatabaseType::PostgreSQL, &users(), &spec);
        assert_eq!(
            sql,
            "SELECT \"id\", \"name\", \"email\", \"profile\" FROM \"users\" \
             WHERE \"name\" = $1 AND \"email\" IS NULL ORDER BY \"id\" DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(spec.params(), vec![QueryParam::from("alice")]);
    }

    #[test]
    fn test_select_offset_without_limit() {
        let spec = SelectSpec {
            offset: Some(5),
            ..SelectSpec::default()
        };
        assert!(select(DatabaseType::SQLite, &users(), &spec).ends_with("LIMIT -1 OFFSET 5"));
        assert!(select(DatabaseType::PostgreSQL, &users(), &spec).ends_with("FROM \"users\" OFFSET 5"));
    }

    #[test]
    fn test_count() {
        let filters = vec![Filter {
            column: "name".into(),
            value: QueryParam::from("bob"),
        }];
        assert_eq!(
            count(DatabaseType::SQLite, "users", &filters),
            "SELECT COUNT(*) AS \"count\" FROM \"users\" WHERE \"name\" = ?"
        );
    }
}
