//! Typed query builder over a model's table.

use super::metadata::Model;
use super::routing::BindHint;
use super::session::RoutedSession;
use crate::db::sql::{Filter, OrderBy, SelectSpec};
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use std::marker::PhantomData;
use std::sync::Arc;

/// Equality filters, ordering and paging over `T`'s table.
///
/// ```ignore
/// let admins: Vec<User> = session
///     .query::<User>()
///     .filter_by("role", "admin")
///     .order_by("name")
///     .limit(10)
///     .all()
///     .await?;
/// ```
#[must_use = "queries do nothing until a terminal method is awaited"]
pub struct Query<T: Model> {
    session: Arc<RoutedSession>,
    spec: SelectSpec,
    hint: Option<BindHint>,
    _model: PhantomData<fn() -> T>,
}

impl<T: Model> Query<T> {
    pub(crate) fn new(session: Arc<RoutedSession>) -> Self {
        Self {
            session,
            spec: SelectSpec::default(),
            hint: None,
            _model: PhantomData,
        }
    }

    /// `column = value`; a null value matches `IS NULL`.
    pub fn filter_by(mut self, column: impl Into<String>, value: impl Into<QueryParam>) -> Self {
        self.spec.filters.push(Filter {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.spec.order_by.push(OrderBy {
            column: column.into(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, column: impl Into<String>) -> Self {
        self.spec.order_by.push(OrderBy {
            column: column.into(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.spec.offset = Some(offset);
        self
    }

    /// Route this query with an explicit hint.
    pub fn bind(mut self, hint: BindHint) -> Self {
        self.hint = Some(hint);
        self
    }

    pub fn spec(&self) -> &SelectSpec {
        &self.spec
    }

    pub async fn all(self) -> DbResult<Vec<T>> {
        self.session.select(&self.spec, self.hint.as_ref()).await
    }

    pub async fn first(mut self) -> DbResult<Option<T>> {
        self.spec.limit = Some(1);
        Ok(self.all().await?.into_iter().next())
    }

    /// Exactly one row, or an error.
    pub async fn one(mut self) -> DbResult<T> {
        self.spec.limit = Some(2);
        let mut rows = self.all().await?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            0 => Err(DbError::invalid_input("Query returned no rows, expected one")),
            n => Err(DbError::invalid_input(format!(
                "Query returned {} rows, expected one",
                n
            ))),
        }
    }

    /// Number of rows matching the filters. Ordering and paging are ignored.
    pub async fn count(self) -> DbResult<u64> {
        self.session.count::<T>(&self.spec, self.hint.as_ref()).await
    }
}

impl<T: Model> std::fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("model", &std::any::type_name::<T>())
            .field("session", &self.session.id())
            .field("spec", &self.spec)
            .field("hint", &self.hint)
            .finish()
    }
}
