//! Routed sessions.
//!
//! A `RoutedSession` is a unit of work bound to one scope. Changes are queued
//! and applied in call order on flush. Each statement asks the routing policy
//! for an engine and runs on that engine's open transaction (begun on demand),
//! or straight on the pool when the session is in autocommit mode.

use super::metadata::{Metadata, Model};
use super::query::Query;
use super::routing::{BindHint, Operation, RouteRequest, RoutingPolicy};
use super::scope::ScopeKey;
use super::statement;
use crate::config::SessionOptions;
use crate::db::sql::{self, Filter, SelectSpec};
use crate::db::{DbTransaction, Engine, EngineRegistry, QueryExecutor, Target};
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnType, DatabaseType, ExecuteResult, JsonRow, QueryParam, QueryResult, TableDef,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Everything a session needs besides its own state. Shared by all sessions.
#[derive(Debug)]
pub struct SessionContext {
    pub registry: EngineRegistry,
    pub metadata: Arc<Metadata>,
    pub policy: RoutingPolicy,
}

/// Snapshot of a live session, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub scope: String,
    pub created_at: DateTime<Utc>,
    pub pending: usize,
    /// Engines with a flushed but uncommitted transaction, in the order opened
    pub open_transactions: Vec<String>,
    pub options: SessionOptions,
}

#[derive(Debug)]
enum PendingKind {
    Insert,
    Merge,
    Delete,
}

#[derive(Debug)]
struct PendingOp {
    kind: PendingKind,
    table: Arc<TableDef>,
    values: JsonRow,
}

#[derive(Debug, Default)]
struct SessionState {
    pending: Vec<PendingOp>,
    transactions: Vec<(String, DbTransaction)>,
}

impl SessionState {
    fn write_in_flight(&self) -> bool {
        !self.pending.is_empty() || !self.transactions.is_empty()
    }

    fn open_transaction(&mut self, engine: &str) -> Option<&mut DbTransaction> {
        self.transactions
            .iter_mut()
            .find(|(name, _)| name == engine)
            .map(|(_, tx)| tx)
    }
}

#[derive(Debug)]
pub struct RoutedSession {
    id: String,
    scope: ScopeKey,
    created_at: DateTime<Utc>,
    options: SessionOptions,
    context: Arc<SessionContext>,
    closed: AtomicBool,
    state: Mutex<SessionState>,
}

impl RoutedSession {
    pub(crate) fn new(scope: ScopeKey, options: SessionOptions, context: Arc<SessionContext>) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        debug!(session_id = %id, scope = %scope, "Session created");
        Self {
            id,
            scope,
            created_at: Utc::now(),
            options,
            context,
            closed: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.context.metadata
    }

    pub async fn info(&self) -> SessionInfo {
        let state = self.state.lock().await;
        SessionInfo {
            id: self.id.clone(),
            scope: self.scope.to_string(),
            created_at: self.created_at,
            pending: state.pending.len(),
            open_transactions: state.transactions.iter().map(|(n, _)| n.clone()).collect(),
            options: self.options,
        }
    }

    fn executor(&self) -> QueryExecutor {
        QueryExecutor::new(self.options.query_timeout())
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::session_closed(&self.id));
        }
        Ok(())
    }

    async fn lock_open(&self) -> DbResult<MutexGuard<'_, SessionState>> {
        self.ensure_open()?;
        let guard = self.state.lock().await;
        // Removed while waiting for the lock
        self.ensure_open()?;
        Ok(guard)
    }

    // =========================================================================
    // Unit of work
    // =========================================================================

    /// Queue an insert of `entity`.
    pub async fn add<T: Model>(&self, entity: &T) -> DbResult<()> {
        self.enqueue(PendingKind::Insert, entity).await
    }

    /// Queue inserts for every entity, in order.
    pub async fn add_all<'a, T, I>(&self, entities: I) -> DbResult<()>
    where
        T: Model,
        I: IntoIterator<Item = &'a T>,
    {
        for entity in entities {
            self.add(entity).await?;
        }
        Ok(())
    }

    /// Queue an update of the row with `entity`'s primary key. The row is
    /// inserted if it does not exist.
    pub async fn merge<T: Model>(&self, entity: &T) -> DbResult<()> {
        self.enqueue(PendingKind::Merge, entity).await
    }

    /// Queue a delete of the row with `entity`'s primary key.
    pub async fn delete<T: Model>(&self, entity: &T) -> DbResult<()> {
        self.enqueue(PendingKind::Delete, entity).await
    }

    async fn enqueue<T: Model>(&self, kind: PendingKind, entity: &T) -> DbResult<()> {
        self.ensure_open()?;
        let table = self.context.metadata.register::<T>()?;
        let values = entity_values(&table, entity)?;
        if !matches!(kind, PendingKind::Insert) {
            key_values(&table, &values)?;
        }

        let mut state = self.lock_open().await?;
        state.pending.push(PendingOp {
            kind,
            table,
            values,
        });
        Ok(())
    }

    /// Apply every pending change in order.
    ///
    /// On failure all open transactions are rolled back, the pending queue is
    /// discarded and the driver error is returned.
    pub async fn flush(&self) -> DbResult<()> {
        let mut state = self.lock_open().await?;
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(&self, state: &mut SessionState) -> DbResult<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut state.pending);
        let start = Instant::now();

        for op in &ops {
            if let Err(e) = self.apply(state, op).await {
                warn!(
                    session_id = %self.id,
                    table = %op.table.name,
                    error = %e,
                    "Flush failed, rolling back"
                );
                Self::rollback_transactions(&self.id, state).await;
                return Err(e);
            }
        }

        debug!(
            session_id = %self.id,
            operations = ops.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Flushed pending changes"
        );
        Ok(())
    }

    async fn apply(&self, state: &mut SessionState, op: &PendingOp) -> DbResult<()> {
        let request = RouteRequest::write()
            .with_entity_bind(op.table.bind_key.clone())
            .with_write_in_flight(true);
        let engine = self.route(&request)?;
        let db = engine.db_type();

        match op.kind {
            PendingKind::Insert => {
                let (sql, params) = insert_statement(db, &op.table, &op.values);
                self.write_execute(state, engine, &sql, &params).await?;
            }
            PendingKind::Merge => {
                let keys = key_values(&op.table, &op.values)?;
                let set: Vec<(&str, QueryParam)> = column_values(&op.table, &op.values)
                    .into_iter()
                    .filter(|(name, _)| !keys.iter().any(|(k, _)| k == name))
                    .collect();

                let updated = if set.is_empty() {
                    0
                } else {
                    let set_cols: Vec<&str> = set.iter().map(|(c, _)| *c).collect();
                    let key_cols: Vec<&str> = keys.iter().map(|(c, _)| *c).collect();
                    let update_sql = sql::update(db, &op.table.name, &set_cols, &key_cols);
                    let params: Vec<QueryParam> = set
                        .into_iter()
                        .chain(keys.iter().cloned())
                        .map(|(_, v)| v)
                        .collect();
                    self.write_execute(state, engine, &update_sql, &params).await?
                };

                // Zero affected rows can also mean "unchanged" on MySQL
                if updated == 0 && !self.row_exists(state, engine, &op.table, &keys).await? {
                    let (sql, params) = insert_statement(db, &op.table, &op.values);
                    self.write_execute(state, engine, &sql, &params).await?;
                }
            }
            PendingKind::Delete => {
                let keys = key_values(&op.table, &op.values)?;
                let key_cols: Vec<&str> = keys.iter().map(|(c, _)| *c).collect();
                let delete_sql = sql::delete(db, &op.table.name, &key_cols);
                let params: Vec<QueryParam> = keys.into_iter().map(|(_, v)| v).collect();
                self.write_execute(state, engine, &delete_sql, &params).await?;
            }
        }
        Ok(())
    }

    async fn row_exists(
        &self,
        state: &mut SessionState,
        engine: &Engine,
        table: &TableDef,
        keys: &[(&str, QueryParam)],
    ) -> DbResult<bool> {
        let filters: Vec<Filter> = keys
            .iter()
            .map(|(c, v)| Filter {
                column: c.to_string(),
                value: v.clone(),
            })
            .collect();
        let count_sql = sql::count(engine.db_type(), &table.name, &filters);
        let params: Vec<QueryParam> = keys.iter().map(|(_, v)| v.clone()).collect();
        let rows = self.write_fetch(state, engine, &count_sql, &params).await?;
        Ok(count_from_rows(&rows)? > 0)
    }

    /// Flush, then commit every open transaction in the order opened.
    pub async fn commit(&self) -> DbResult<()> {
        let mut state = self.lock_open().await?;
        self.flush_locked(&mut state).await?;

        let transactions = std::mem::take(&mut state.transactions);
        let count = transactions.len();
        let mut iter = transactions.into_iter();
        while let Some((engine, tx)) = iter.next() {
            if let Err(e) = tx.commit().await {
                warn!(session_id = %self.id, engine = %engine, error = %e, "Commit failed");
                for (rest_engine, rest) in iter.by_ref() {
                    if let Err(e) = rest.rollback().await {
                        warn!(engine = %rest_engine, error = %e, "Rollback after failed commit failed");
                    }
                }
                return Err(e);
            }
            debug!(session_id = %self.id, engine = %engine, "Transaction committed");
        }

        info!(session_id = %self.id, transactions = count, "Session committed");
        Ok(())
    }

    /// Discard pending changes and roll back every open transaction.
    pub async fn rollback(&self) -> DbResult<()> {
        let mut state = self.lock_open().await?;
        let discarded = state.pending.len();
        state.pending.clear();

        let mut first_error = None;
        for (engine, tx) in std::mem::take(&mut state.transactions) {
            if let Err(e) = tx.rollback().await {
                warn!(session_id = %self.id, engine = %engine, error = %e, "Rollback failed");
                first_error.get_or_insert(e);
            }
        }

        info!(session_id = %self.id, discarded = discarded, "Session rolled back");
        first_error.map_or(Ok(()), Err)
    }

    async fn rollback_transactions(session_id: &str, state: &mut SessionState) {
        for (engine, tx) in std::mem::take(&mut state.transactions) {
            if let Err(e) = tx.rollback().await {
                warn!(session_id = %session_id, engine = %engine, error = %e, "Rollback failed");
            }
        }
    }

    /// Invalidate the session: pending changes are dropped, open transactions
    /// rolled back and every later call fails with `SessionClosed`.
    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        let discarded = state.pending.len();
        state.pending.clear();
        Self::rollback_transactions(&self.id, &mut state).await;
        debug!(session_id = %self.id, scope = %self.scope, discarded = discarded, "Session closed");
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Start a query over `T`'s table.
    pub fn query<T: Model>(self: &Arc<Self>) -> Query<T> {
        Query::new(Arc::clone(self))
    }

    /// Fetch one entity by (single-column) primary key.
    pub async fn get<T: Model>(self: &Arc<Self>, pk: impl Into<QueryParam>) -> DbResult<Option<T>> {
        let table = self.context.metadata.register::<T>()?;
        let pk_columns = table.require_primary_key()?;
        if pk_columns.len() != 1 {
            return Err(DbError::invalid_input(format!(
                "get() needs a single-column primary key, '{}' has {}",
                table.name,
                pk_columns.len()
            )));
        }
        let column = pk_columns[0].name.clone();
        self.query::<T>().filter_by(column, pk).first().await
    }

    pub(crate) async fn select<T: Model>(
        &self,
        spec: &SelectSpec,
        hint: Option<&BindHint>,
    ) -> DbResult<Vec<T>> {
        let table = self.context.metadata.register::<T>()?;
        check_columns(&table, spec)?;

        let (_, rows) = self
            .read(
                Some(table.as_ref()),
                hint,
                |db| sql::select(db, &table, spec),
                &spec.params(),
            )
            .await?;
        rows.into_iter()
            .map(|row| row_to_entity(&table, row))
            .collect()
    }

    pub(crate) async fn count<T: Model>(
        &self,
        spec: &SelectSpec,
        hint: Option<&BindHint>,
    ) -> DbResult<u64> {
        let table = self.context.metadata.register::<T>()?;
        check_columns(&table, spec)?;

        let (_, rows) = self
            .read(
                Some(table.as_ref()),
                hint,
                |db| sql::count(db, &table.name, &spec.filters),
                &spec.params(),
            )
            .await?;
        count_from_rows(&rows)
    }

    /// Routed read. Autoflush runs first when enabled; the read joins the
    /// engine's open transaction if there is one.
    async fn read(
        &self,
        table: Option<&TableDef>,
        hint: Option<&BindHint>,
        build_sql: impl FnOnce(DatabaseType) -> String,
        params: &[QueryParam],
    ) -> DbResult<(String, Vec<JsonRow>)> {
        let mut state = self.lock_open().await?;
        if self.options.autoflush {
            self.flush_locked(&mut state).await?;
        }

        let request = RouteRequest::read()
            .with_hint(hint.cloned())
            .with_entity_bind(table.and_then(|t| t.bind_key.clone()))
            .with_write_in_flight(state.write_in_flight());
        let engine = self.route(&request)?;
        let sql = build_sql(engine.db_type());

        let target = match state.open_transaction(engine.name()) {
            Some(tx) => Target::Transaction(tx),
            None => Target::Pool,
        };
        let rows = self.executor().fetch_all(engine, target, &sql, params).await?;
        Ok((engine.name().to_string(), rows))
    }

    // =========================================================================
    // Raw statements
    // =========================================================================

    /// Run a raw write statement. It joins the unit of work like a flushed change.
    pub async fn execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        hint: Option<BindHint>,
    ) -> DbResult<ExecuteResult> {
        let start = Instant::now();
        let mut state = self.lock_open().await?;
        if self.options.autoflush {
            self.flush_locked(&mut state).await?;
        }

        let request = RouteRequest::write()
            .with_hint(hint)
            .with_write_in_flight(state.write_in_flight());
        let engine = self.route(&request)?;
        let rows_affected = match self.write_execute(&mut state, engine, sql, params).await {
            Ok(n) => n,
            Err(e) => {
                Self::rollback_transactions(&self.id, &mut state).await;
                return Err(e);
            }
        };

        Ok(ExecuteResult {
            engine: engine.name().to_string(),
            rows_affected,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Run raw SQL that returns rows. Statements that do not parse as pure reads
    /// are routed and executed as writes.
    pub async fn fetch(
        &self,
        sql: &str,
        params: &[QueryParam],
        hint: Option<BindHint>,
    ) -> DbResult<QueryResult> {
        let start = Instant::now();
        let db_type = match &hint {
            Some(h) => self
                .context
                .policy
                .resolve_hint(h, &self.context.metadata)
                .and_then(|name| self.context.registry.get(&name).ok())
                .unwrap_or_else(|| self.context.registry.default_engine())
                .db_type(),
            None => self.context.registry.default_engine().db_type(),
        };

        let (engine, rows) = match statement::classify(sql, db_type) {
            Operation::Read => {
                self.read(None, hint.as_ref(), |_| sql.to_string(), params)
                    .await?
            }
            Operation::Write => {
                let mut state = self.lock_open().await?;
                if self.options.autoflush {
                    self.flush_locked(&mut state).await?;
                }
                let request = RouteRequest::write()
                    .with_hint(hint)
                    .with_write_in_flight(state.write_in_flight());
                let engine = self.route(&request)?;
                match self.write_fetch(&mut state, engine, sql, params).await {
                    Ok(rows) => (engine.name().to_string(), rows),
                    Err(e) => {
                        Self::rollback_transactions(&self.id, &mut state).await;
                        return Err(e);
                    }
                }
            }
        };

        Ok(QueryResult {
            engine,
            rows,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn route(&self, request: &RouteRequest) -> DbResult<&Engine> {
        let name = self
            .context
            .policy
            .route(request, &self.context.metadata)?;
        debug!(
            session_id = %self.id,
            engine = %name,
            operation = ?request.operation,
            "Routed statement"
        );
        self.context.registry.get(&name)
    }

    async fn write_execute(
        &self,
        state: &mut SessionState,
        engine: &Engine,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<u64> {
        if self.options.autocommit {
            return self.executor().execute(engine, Target::Pool, sql, params).await;
        }
        let tx = self.transaction_for(state, engine).await?;
        self.executor()
            .execute(engine, Target::Transaction(tx), sql, params)
            .await
    }

    async fn write_fetch(
        &self,
        state: &mut SessionState,
        engine: &Engine,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        if self.options.autocommit {
            return self.executor().fetch_all(engine, Target::Pool, sql, params).await;
        }
        let tx = self.transaction_for(state, engine).await?;
        self.executor()
            .fetch_all(engine, Target::Transaction(tx), sql, params)
            .await
    }

    async fn transaction_for<'s>(
        &self,
        state: &'s mut SessionState,
        engine: &Engine,
    ) -> DbResult<&'s mut DbTransaction> {
        let idx = match state
            .transactions
            .iter()
            .position(|(name, _)| name == engine.name())
        {
            Some(idx) => idx,
            None => {
                let tx = DbTransaction::begin(engine.pool()).await?;
                debug!(session_id = %self.id, engine = %engine.name(), "Transaction started");
                state.transactions.push((engine.name().to_string(), tx));
                state.transactions.len() - 1
            }
        };
        Ok(&mut state.transactions[idx].1)
    }
}

// =============================================================================
// Entity mapping
// =============================================================================

/// Serialize an entity into a column map.
fn entity_values<T: Serialize>(table: &TableDef, entity: &T) -> DbResult<JsonRow> {
    match serde_json::to_value(entity) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(other) => Err(DbError::invalid_input(format!(
            "Model for table '{}' must serialize to an object, got {}",
            table.name,
            json_kind(&other)
        ))),
        Err(e) => Err(DbError::invalid_input(format!(
            "Failed to serialize model for table '{}': {}",
            table.name, e
        ))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Table columns present in `values`, in table order, as parameters.
fn column_values<'t>(table: &'t TableDef, values: &JsonRow) -> Vec<(&'t str, QueryParam)> {
    table
        .columns
        .iter()
        .filter_map(|c| {
            values
                .get(&c.name)
                .map(|v| (c.name.as_str(), QueryParam::for_column(v, c.column_type)))
        })
        .collect()
}

/// Primary key columns and their (non-null) values.
fn key_values<'t>(table: &'t TableDef, values: &JsonRow) -> DbResult<Vec<(&'t str, QueryParam)>> {
    table
        .require_primary_key()?
        .into_iter()
        .map(|c| match values.get(&c.name) {
            Some(v) if !v.is_null() => Ok((c.name.as_str(), QueryParam::for_column(v, c.column_type))),
            _ => Err(DbError::invalid_input(format!(
                "Primary key column '{}' of '{}' has no value",
                c.name, table.name
            ))),
        })
        .collect()
}

/// INSERT for the non-null columns in `values`. Nulls are left out so column
/// defaults and generated primary keys apply.
fn insert_statement(
    db: DatabaseType,
    table: &TableDef,
    values: &JsonRow,
) -> (String, Vec<QueryParam>) {
    let present: Vec<(&str, QueryParam)> = column_values(table, values)
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .collect();
    let columns: Vec<&str> = present.iter().map(|(c, _)| *c).collect();
    let sql = sql::insert(db, &table.name, &columns);
    (sql, present.into_iter().map(|(_, v)| v).collect())
}

/// Decode a row into an entity, normalizing backend-specific representations.
fn row_to_entity<T: DeserializeOwned>(table: &TableDef, mut row: JsonRow) -> DbResult<T> {
    for column in &table.columns {
        if let Some(value) = row.get_mut(&column.name) {
            coerce_value(column.column_type, value);
        }
    }
    serde_json::from_value(JsonValue::Object(row)).map_err(|e| {
        DbError::schema(format!("Row does not match model: {}", e), &table.name)
    })
}

fn coerce_value(column_type: ColumnType, value: &mut JsonValue) {
    match (column_type, &*value) {
        // JSON stored as text (SQLite)
        (ColumnType::Json, JsonValue::String(s)) => {
            if let Ok(parsed) = serde_json::from_str::<JsonValue>(s) {
                *value = parsed;
            }
        }
        // BOOLEAN stored as an integer (SQLite, MySQL TINYINT(1))
        (ColumnType::Boolean, JsonValue::Number(n)) => {
            *value = JsonValue::Bool(n.as_i64().unwrap_or(0) != 0);
        }
        // Binary columns are decoded as base64 strings
        (ColumnType::Blob, JsonValue::String(s)) => {
            use base64::{Engine as _, engine::general_purpose::STANDARD};
            if let Ok(bytes) = STANDARD.decode(s) {
                *value = JsonValue::Array(bytes.into_iter().map(JsonValue::from).collect());
            }
        }
        _ => {}
    }
}

fn count_from_rows(rows: &[JsonRow]) -> DbResult<u64> {
    rows.first()
        .and_then(|row| row.values().next())
        .and_then(|v| match v {
            JsonValue::Number(n) => n.as_u64(),
            // Some drivers report COUNT as a decimal string
            JsonValue::String(s) => s.parse().ok(),
            _ => None,
        })
        .ok_or_else(|| DbError::internal("COUNT query returned no value"))
}

fn check_columns(table: &TableDef, spec: &SelectSpec) -> DbResult<()> {
    let names = spec
        .filters
        .iter()
        .map(|f| &f.column)
        .chain(spec.order_by.iter().map(|o| &o.column));
    for name in names {
        if table.get_column(name).is_none() {
            return Err(DbError::invalid_input(format!(
                "Unknown column '{}' on table '{}'",
                name, table.name
            )));
        }
    }
    Ok(())
}
