//! Read/write classification of raw SQL.
//!
//! Uses [sqlparser](https://docs.rs/sqlparser/) so that only statements that
//! parse as pure reads may be routed to a read engine. Anything else, including
//! SQL the parser cannot handle, is treated as a write.

use super::routing::Operation;
use crate::models::DatabaseType;
use sqlparser::ast::Statement;
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use tracing::debug;

/// Get the appropriate SQL dialect for the given database type.
fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Classify SQL as a read or a write for routing.
pub fn classify(sql: &str, db_type: DatabaseType) -> Operation {
    let dialect = get_dialect(db_type);
    let statements = match Parser::parse_sql(dialect.as_ref(), sql) {
        Ok(statements) => statements,
        Err(e) => {
            debug!(error = %e, "Unparseable SQL routed as a write");
            return Operation::Write;
        }
    };

    if !statements.is_empty() && statements.iter().all(is_read) {
        Operation::Read
    } else {
        Operation::Write
    }
}

fn is_read(stmt: &Statement) -> bool {
    match stmt {
        // SELECT ... FOR UPDATE takes row locks
        Statement::Query(query) => query.locks.is_empty(),
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowSchemas { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowFunctions { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowVariables { .. }
        | Statement::ShowStatus { .. }
        | Statement::ShowCollation { .. }
        | Statement::ExplainTable { .. } => true,
        Statement::Explain { statement, .. } => is_read(statement),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DB: DatabaseType = DatabaseType::PostgreSQL;

    #[test]
    fn test_select_is_read() {
        assert_eq!(classify("SELECT * FROM users", DB), Operation::Read);
        assert_eq!(
            classify(
                "SELECT * FROM users WHERE id IN (SELECT user_id FROM orders)",
                DB
            ),
            Operation::Read
        );
        assert_eq!(
            classify("SELECT id FROM a UNION SELECT id FROM b", DB),
            Operation::Read
        );
    }

    #[test]
    fn test_writes() {
        assert_eq!(classify("INSERT INTO users VALUES (1)", DB), Operation::Write);
        assert_eq!(classify("UPDATE users SET name = 'x'", DB), Operation::Write);
        assert_eq!(classify("DELETE FROM users", DB), Operation::Write);
        assert_eq!(classify("CREATE TABLE t (id INT)", DB), Operation::Write);
        assert_eq!(classify("BEGIN", DB), Operation::Write);
    }

    #[test]
    fn test_locking_select_is_write() {
        assert_eq!(
            classify("SELECT * FROM users WHERE id = 1 FOR UPDATE", DB),
            Operation::Write
        );
    }

    #[test]
    fn test_explain_follows_inner_statement() {
        assert_eq!(classify("EXPLAIN SELECT * FROM users", DB), Operation::Read);
        assert_eq!(
            classify("EXPLAIN DELETE FROM users", DB),
            Operation::Write
        );
    }

    #[test]
    fn test_mixed_batch_is_write() {
        assert_eq!(
            classify("SELECT 1; DELETE FROM users", DB),
            Operation::Write
        );
    }

    #[test]
    fn test_unparseable_and_empty_are_writes() {
        assert_eq!(classify("SELEC nonsense", DB), Operation::Write);
        assert_eq!(classify("", DB), Operation::Write);
    }

    #[test]
    fn test_dialects() {
        assert_eq!(
            classify("SELECT `id` FROM `users`", DatabaseType::MySQL),
            Operation::Read
        );
        assert_eq!(
            classify("SELECT \"id\" FROM \"users\" LIMIT -1 OFFSET 5", DatabaseType::SQLite),
            Operation::Read
        );
    }
}
