//! Statement execution.
//!
//! This module runs one statement on an engine, either directly on its pool or
//! inside a transaction the session holds open for that engine. Every statement
//! is bounded by the session's query timeout.
//!
//! # Architecture
//!
//! The executor uses database-specific implementations organized in submodules:
//! - `mysql`: MySQL-specific execute and fetch
//! - `postgres`: PostgreSQL-specific execute and fetch
//! - `sqlite`: SQLite-specific execute and fetch
//!
//! Each submodule is generic over the sqlx executor, so pools and open
//! transactions share one code path.

use crate::db::pool::{DbPool, Engine};
use crate::db::transaction::DbTransaction;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{JsonRow, QueryParam};
use futures_util::TryStreamExt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Where a statement runs.
#[derive(Debug)]
pub enum Target<'a> {
    /// A connection checked out of the engine's pool for this statement only.
    Pool,
    /// The session's open transaction on this engine.
    Transaction(&'a mut DbTransaction),
}

impl Target<'_> {
    fn in_transaction(&self) -> bool {
        matches!(self, Target::Transaction(_))
    }
}

/// Executes routed statements with a fixed timeout.
#[derive(Debug, Clone, Copy)]
pub struct QueryExecutor {
    query_timeout: Duration,
}

impl QueryExecutor {
    pub fn new(query_timeout: Duration) -> Self {
        Self { query_timeout }
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Run a statement that does not return rows and report affected rows.
    pub async fn execute(
        &self,
        engine: &Engine,
        target: Target<'_>,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<u64> {
        log_statement(engine, sql, params, target.in_transaction());

        let rows_affected = match (engine.pool(), target) {
            (DbPool::MySql(p), Target::Pool) => {
                mysql::execute(p, sql, params, self.query_timeout).await?
            }
            (DbPool::Postgres(p), Target::Pool) => {
                postgres::execute(p, sql, params, self.query_timeout).await?
            }
            (DbPool::SQLite(p), Target::Pool) => {
                sqlite::execute(p, sql, params, self.query_timeout).await?
            }
            (_, Target::Transaction(DbTransaction::MySql(tx))) => {
                mysql::execute(&mut **tx, sql, params, self.query_timeout).await?
            }
            (_, Target::Transaction(DbTransaction::Postgres(tx))) => {
                postgres::execute(&mut **tx, sql, params, self.query_timeout).await?
            }
            (_, Target::Transaction(DbTransaction::SQLite(tx))) => {
                sqlite::execute(&mut **tx, sql, params, self.query_timeout).await?
            }
        };

        debug!(
            engine = %engine.name(),
            rows_affected = rows_affected,
            "Statement executed"
        );
        Ok(rows_affected)
    }

    /// Run a statement and decode every returned row.
    pub async fn fetch_all(
        &self,
        engine: &Engine,
        target: Target<'_>,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        log_statement(engine, sql, params, target.in_transaction());

        let rows = match (engine.pool(), target) {
            (DbPool::MySql(p), Target::Pool) => {
                mysql::fetch_all(p, sql, params, self.query_timeout).await?
            }
            (DbPool::Postgres(p), Target::Pool) => {
                postgres::fetch_all(p, sql, params, self.query_timeout).await?
            }
            (DbPool::SQLite(p), Target::Pool) => {
                sqlite::fetch_all(p, sql, params, self.query_timeout).await?
            }
            (_, Target::Transaction(DbTransaction::MySql(tx))) => {
                mysql::fetch_all(&mut **tx, sql, params, self.query_timeout).await?
            }
            (_, Target::Transaction(DbTransaction::Postgres(tx))) => {
                postgres::fetch_all(&mut **tx, sql, params, self.query_timeout).await?
            }
            (_, Target::Transaction(DbTransaction::SQLite(tx))) => {
                sqlite::fetch_all(&mut **tx, sql, params, self.query_timeout).await?
            }
        };

        debug!(engine = %engine.name(), rows = rows.len(), "Rows fetched");
        Ok(rows)
    }
}

/// Statements on an engine with `echo` enabled are logged at info level.
fn log_statement(engine: &Engine, sql: &str, params: &[QueryParam], in_transaction: bool) {
    if engine.echo() {
        info!(
            engine = %engine.name(),
            sql = %sql,
            params = ?params,
            in_transaction = in_transaction,
            "Executing statement"
        );
    } else {
        debug!(
            engine = %engine.name(),
            sql = %sql,
            params = params.len(),
            in_transaction = in_transaction,
            "Executing statement"
        );
    }
}

fn timeout_error(operation: &str, timeout: Duration) -> DbError {
    DbError::timeout(operation, timeout.as_secs() as u32)
}

type Timed<T> = Result<Result<T, sqlx::Error>, tokio::time::error::Elapsed>;

fn collect_rows<R: RowToJson>(
    result: Timed<Vec<R>>,
    query_timeout: Duration,
) -> DbResult<Vec<JsonRow>> {
    match result {
        Ok(Ok(rows)) => Ok(rows.iter().map(|r| r.to_json_map()).collect()),
        Ok(Err(e)) => Err(DbError::from(e)),
        Err(_) => Err(timeout_error("query execution", query_timeout)),
    }
}

fn rows_affected(result: Timed<u64>, query_timeout: Duration) -> DbResult<u64> {
    match result {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(DbError::from(e)),
        Err(_) => Err(timeout_error("write operation", query_timeout)),
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// When params is empty, raw SQL is sent unprepared so statements that do not
// support prepared execution (some DDL) still work.

mod mysql {
    use super::*;
    use crate::db::params::bind_mysql_param;
    use sqlx::MySql;
    use sqlx::mysql::MySqlRow;

    pub async fn execute<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64>
    where
        E: sqlx::Executor<'c, Database = MySql>,
    {
        let result = if params.is_empty() {
            timeout(query_timeout, async {
                executor.execute(sql).await.map(|r| r.rows_affected())
            })
            .await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            timeout(query_timeout, async {
                query.execute(executor).await.map(|r| r.rows_affected())
            })
            .await
        };
        rows_affected(result, query_timeout)
    }

    pub async fn fetch_all<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<Vec<JsonRow>>
    where
        E: sqlx::Executor<'c, Database = MySql>,
    {
        let result = if params.is_empty() {
            timeout(query_timeout, executor.fetch(sql).try_collect::<Vec<MySqlRow>>()).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_mysql_param(query, param);
            }
            timeout(query_timeout, query.fetch(executor).try_collect::<Vec<MySqlRow>>()).await
        };
        collect_rows(result, query_timeout)
    }
}

mod postgres {
    use super::*;
    use crate::db::params::bind_postgres_param;
    use sqlx::Postgres;
    use sqlx::postgres::PgRow;

    pub async fn execute<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let result = if params.is_empty() {
            timeout(query_timeout, async {
                executor.execute(sql).await.map(|r| r.rows_affected())
            })
            .await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            timeout(query_timeout, async {
                query.execute(executor).await.map(|r| r.rows_affected())
            })
            .await
        };
        rows_affected(result, query_timeout)
    }

    pub async fn fetch_all<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<Vec<JsonRow>>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let result = if params.is_empty() {
            timeout(query_timeout, executor.fetch(sql).try_collect::<Vec<PgRow>>()).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_postgres_param(query, param);
            }
            timeout(query_timeout, query.fetch(executor).try_collect::<Vec<PgRow>>()).await
        };
        collect_rows(result, query_timeout)
    }
}

mod sqlite {
    use super::*;
    use crate::db::params::bind_sqlite_param;
    use sqlx::Sqlite;
    use sqlx::sqlite::SqliteRow;

    pub async fn execute<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<u64>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        let result = if params.is_empty() {
            timeout(query_timeout, async {
                executor.execute(sql).await.map(|r| r.rows_affected())
            })
            .await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            timeout(query_timeout, async {
                query.execute(executor).await.map(|r| r.rows_affected())
            })
            .await
        };
        rows_affected(result, query_timeout)
    }

    pub async fn fetch_all<'c, E>(
        executor: E,
        sql: &str,
        params: &[QueryParam],
        query_timeout: Duration,
    ) -> DbResult<Vec<JsonRow>>
    where
        E: sqlx::Executor<'c, Database = Sqlite>,
    {
        let result = if params.is_empty() {
            timeout(query_timeout, executor.fetch(sql).try_collect::<Vec<SqliteRow>>()).await
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = bind_sqlite_param(query, param);
            }
            timeout(query_timeout, query.fetch(executor).try_collect::<Vec<SqliteRow>>()).await
        };
        collect_rows(result, query_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;

    async fn memory_engine() -> Engine {
        Engine::connect("default", "sqlite::memory:", &EngineOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_execute_and_fetch_on_pool() {
        let engine = memory_engine().await;
        let executor = QueryExecutor::new(Duration::from_secs(5));

        executor
            .execute(&engine, Target::Pool, "CREATE TABLE t (id INTEGER, name TEXT)", &[])
            .await
            .unwrap();
        let affected = executor
            .execute(
                &engine,
                Target::Pool,
                "INSERT INTO t (id, name) VALUES (?, ?)",
                &[QueryParam::Int(1), QueryParam::from("alice")],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let rows = executor
            .fetch_all(&engine, Target::Pool, "SELECT id, name FROM t", &[])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], serde_json::json!("alice"));
    }

    #[tokio::test]
    async fn test_fetch_inside_transaction_sees_uncommitted_rows() {
        let engine = memory_engine().await;
        let executor = QueryExecutor::new(Duration::from_secs(5));
        executor
            .execute(&engine, Target::Pool, "CREATE TABLE t (id INTEGER)", &[])
            .await
            .unwrap();

        let mut tx = DbTransaction::begin(engine.pool()).await.unwrap();
        executor
            .execute(
                &engine,
                Target::Transaction(&mut tx),
                "INSERT INTO t (id) VALUES (?)",
                &[QueryParam::Int(7)],
            )
            .await
            .unwrap();
        let rows = executor
            .fetch_all(&engine, Target::Transaction(&mut tx), "SELECT id FROM t", &[])
            .await
            .unwrap();
        assert_eq!(rows[0]["id"], serde_json::json!(7));
        tx.rollback().await.unwrap();

        let rows = executor
            .fetch_all(&engine, Target::Pool, "SELECT id FROM t", &[])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_driver_error_passes_through() {
        let engine = memory_engine().await;
        let executor = QueryExecutor::new(Duration::from_secs(5));
        let err = executor
            .fetch_all(&engine, Target::Pool, "SELECT * FROM missing_table", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Database { .. }));
    }
}
