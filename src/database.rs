//! The `Database` facade.
//!
//! Owns the model metadata, the engine registry, the routing policy and the
//! scoped session factory, and forwards unit-of-work calls to the session of
//! the current scope.

use crate::config::{EngineOptions, SessionOptions, SessionOptionsUpdate, split_options};
use crate::db::{Engine, EngineRegistry, QueryExecutor, Target, sql};
use crate::error::{DbError, DbResult};
use crate::models::{EngineInfo, ExecuteResult, QueryParam, QueryResult, TableDef};
use crate::orm::{
    BindHint, Metadata, Model, Query, RoutedSession, RoutingPolicy, ScopeFn, ScopeKey,
    SessionContext, SessionFactory, SessionInfo, with_scope,
};
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Which tables a schema operation touches.
#[derive(Debug, Clone)]
pub struct SchemaOptions {
    /// Table names; `None` means every registered table
    pub tables: Option<Vec<String>>,
    /// Skip existing tables on create and missing ones on drop
    pub checkfirst: bool,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            tables: None,
            checkfirst: true,
        }
    }
}

#[derive(Default)]
pub struct DatabaseBuilder {
    databases: Vec<(String, String)>,
    options: Vec<(String, String)>,
    session_options: SessionOptionsUpdate,
    engine_options: EngineOptions,
    read_engine: Option<String>,
    metadata: Option<Arc<Metadata>>,
    scope_fn: Option<ScopeFn>,
}

impl DatabaseBuilder {
    pub fn database(mut self, name: impl Into<String>, uri: impl Into<String>) -> Self {
        self.databases.push((name.into(), uri.into()));
        self
    }

    pub fn databases<I, K, V>(mut self, databases: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.databases
            .extend(databases.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Free-form option, split into session and engine options on connect.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    pub fn session_options(mut self, update: SessionOptionsUpdate) -> Self {
        self.session_options = update;
        self
    }

    /// Pool options shared by every engine. URI query parameters override them.
    pub fn engine_options(mut self, options: EngineOptions) -> Self {
        self.engine_options = options;
        self
    }

    pub fn read_engine(mut self, name: impl Into<String>) -> Self {
        self.read_engine = Some(name.into());
        self
    }

    pub fn metadata(mut self, metadata: Arc<Metadata>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn scope_fn(mut self, f: impl Fn() -> ScopeKey + Send + Sync + 'static) -> Self {
        let scope_fn: ScopeFn = Arc::new(f);
        self.scope_fn = Some(scope_fn);
        self
    }

    /// Validate the configuration and open every engine.
    pub async fn connect(self) -> DbResult<Database> {
        let (bag_session, bag_engine) = split_options(self.options)?;

        let mut session_options = SessionOptions::default();
        session_options.apply(&self.session_options);
        session_options.apply(&bag_session);
        let engine_options = self.engine_options.merged_with(&bag_engine);

        let metadata = self.metadata.unwrap_or_default();
        let registry = EngineRegistry::connect(self.databases, &engine_options).await?;
        let policy = match RoutingPolicy::new(&registry, self.read_engine) {
            Ok(policy) => policy,
            Err(e) => {
                registry.close_all().await;
                return Err(e);
            }
        };

        info!(
            engines = ?registry.names(),
            read_engine = ?policy.read_engine(),
            autoflush = session_options.autoflush,
            autocommit = session_options.autocommit,
            "Database connected"
        );

        let context = Arc::new(SessionContext {
            registry,
            metadata,
            policy,
        });
        let factory = SessionFactory::new(Arc::clone(&context), session_options, self.scope_fn);
        Ok(Database {
            inner: Arc::new(Inner { context, factory }),
        })
    }
}

struct Inner {
    context: Arc<SessionContext>,
    factory: SessionFactory,
}

/// Multi-engine database with scoped, routed sessions. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    /// Connect a `name -> uri` mapping with a free-form option bag.
    pub async fn connect<I, K, V, O, OK, OV>(databases: I, options: O) -> DbResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        O: IntoIterator<Item = (OK, OV)>,
        OK: Into<String>,
        OV: Into<String>,
    {
        options
            .into_iter()
            .fold(Self::builder().databases(databases), |b, (k, v)| b.option(k, v))
            .connect()
            .await
    }

    fn context(&self) -> &SessionContext {
        &self.inner.context
    }

    // =========================================================================
    // Model base and registry
    // =========================================================================

    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.context().metadata
    }

    pub fn register<T: Model>(&self) -> DbResult<Arc<TableDef>> {
        self.metadata().register::<T>()
    }

    pub fn engine(&self, name: &str) -> DbResult<&Engine> {
        self.context().registry.get(name)
    }

    pub fn engine_names(&self) -> Vec<String> {
        self.context().registry.names()
    }

    pub fn engines(&self) -> Vec<EngineInfo> {
        self.context().registry.iter().map(Engine::info).collect()
    }

    pub fn routing(&self) -> &RoutingPolicy {
        &self.context().policy
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Session of the current scope.
    pub async fn session(&self) -> Arc<RoutedSession> {
        self.inner.factory.current().await
    }

    pub async fn session_for(&self, key: impl Into<ScopeKey>) -> Arc<RoutedSession> {
        self.inner.factory.get_or_create(key.into()).await
    }

    pub fn current_scope(&self) -> ScopeKey {
        self.inner.factory.current_scope()
    }

    /// End the current scope's session. Call at the end of every unit of work.
    pub async fn remove(&self) -> bool {
        self.inner.factory.remove_current().await
    }

    pub async fn remove_scope(&self, key: &ScopeKey) -> bool {
        self.inner.factory.remove(key).await
    }

    /// Run `fut` with `key` as the scope of the default scope function.
    pub async fn scope<F: Future>(&self, key: impl Into<ScopeKey>, fut: F) -> F::Output {
        with_scope(key.into(), fut).await
    }

    /// Change session options for sessions created from now on.
    pub async fn reconfigure(&self, update: SessionOptionsUpdate) {
        self.inner.factory.reconfigure(&update).await
    }

    pub fn session_options(&self) -> SessionOptions {
        self.inner.factory.options()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.factory.sessions().await
    }

    // =========================================================================
    // Current-session passthroughs
    // =========================================================================

    pub async fn add<T: Model>(&self, entity: &T) -> DbResult<()> {
        self.session().await.add(entity).await
    }

    pub async fn add_all<'a, T, I>(&self, entities: I) -> DbResult<()>
    where
        T: Model,
        I: IntoIterator<Item = &'a T>,
    {
        self.session().await.add_all(entities).await
    }

    pub async fn merge<T: Model>(&self, entity: &T) -> DbResult<()> {
        self.session().await.merge(entity).await
    }

    pub async fn delete<T: Model>(&self, entity: &T) -> DbResult<()> {
        self.session().await.delete(entity).await
    }

    pub async fn flush(&self) -> DbResult<()> {
        self.session().await.flush().await
    }

    pub async fn commit(&self) -> DbResult<()> {
        self.session().await.commit().await
    }

    pub async fn rollback(&self) -> DbResult<()> {
        self.session().await.rollback().await
    }

    pub async fn query<T: Model>(&self) -> Query<T> {
        self.session().await.query::<T>()
    }

    pub async fn get<T: Model>(&self, pk: impl Into<QueryParam>) -> DbResult<Option<T>> {
        self.session().await.get::<T>(pk).await
    }

    pub async fn execute(
        &self,
        sql: &str,
        params: &[QueryParam],
        hint: Option<BindHint>,
    ) -> DbResult<ExecuteResult> {
        self.session().await.execute(sql, params, hint).await
    }

    pub async fn fetch(
        &self,
        sql: &str,
        params: &[QueryParam],
        hint: Option<BindHint>,
    ) -> DbResult<QueryResult> {
        self.session().await.fetch(sql, params, hint).await
    }

    // =========================================================================
    // Schema
    // =========================================================================

    /// Create every registered table on `engine` (`None` means `"default"`).
    pub async fn create_schema(&self, engine: Option<&str>) -> DbResult<()> {
        self.create_schema_with(engine, &SchemaOptions::default())
            .await
    }

    /// Drop every registered table on `engine`, in reverse registration order.
    pub async fn drop_schema(&self, engine: Option<&str>) -> DbResult<()> {
        self.drop_schema_with(engine, &SchemaOptions::default()).await
    }

    pub async fn create_schema_with(
        &self,
        engine: Option<&str>,
        options: &SchemaOptions,
    ) -> DbResult<()> {
        let engine = self.schema_engine(engine)?;
        let tables = self.schema_tables(options)?;
        let executor = QueryExecutor::new(self.session_options().query_timeout());
        let db = engine.db_type();

        for table in &tables {
            let ddl = sql::create_table(db, table, options.checkfirst);
            executor.execute(engine, Target::Pool, &ddl, &[]).await?;
        }
        info!(engine = %engine.name(), tables = tables.len(), "Schema created");
        Ok(())
    }

    pub async fn drop_schema_with(
        &self,
        engine: Option<&str>,
        options: &SchemaOptions,
    ) -> DbResult<()> {
        let engine = self.schema_engine(engine)?;
        let tables = self.schema_tables(options)?;
        let executor = QueryExecutor::new(self.session_options().query_timeout());
        let db = engine.db_type();

        for table in tables.iter().rev() {
            let ddl = sql::drop_table(db, table, options.checkfirst);
            executor.execute(engine, Target::Pool, &ddl, &[]).await?;
        }
        info!(engine = %engine.name(), tables = tables.len(), "Schema dropped");
        Ok(())
    }

    fn schema_engine(&self, engine: Option<&str>) -> DbResult<&Engine> {
        match engine {
            Some(name) => self.engine(name),
            None => Ok(self.context().registry.default_engine()),
        }
    }

    /// Selected tables in registration order.
    fn schema_tables(&self, options: &SchemaOptions) -> DbResult<Vec<Arc<TableDef>>> {
        let all = self.metadata().tables();
        let Some(names) = &options.tables else {
            return Ok(all);
        };
        if let Some(missing) = names.iter().find(|n| !all.iter().any(|t| &t.name == *n)) {
            return Err(DbError::schema("Table is not registered", missing));
        }
        Ok(all
            .into_iter()
            .filter(|t| names.contains(&t.name))
            .collect())
    }

    /// Remove every session and close every engine.
    pub async fn close(&self) {
        let sessions = self.inner.factory.len().await;
        if sessions > 0 {
            warn!(sessions = sessions, "Closing database with live sessions");
        }
        self.inner.factory.remove_all().await;
        self.context().registry.close_all().await;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engines: Vec<(String, String)> = self
            .context()
            .registry
            .iter()
            .map(|e| (e.name().to_string(), e.config().masked_connection_string()))
            .collect();
        f.debug_struct("Database")
            .field("engines", &engines)
            .field("read_engine", &self.routing().read_engine())
            .finish()
    }
}
