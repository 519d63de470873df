//! Binding `QueryParam` values onto backend-specific sqlx queries.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

/// Generates a bind function. `$json` turns a `&serde_json::Value` into
/// something the backend can encode.
macro_rules! bind_fn {
    ($name:ident<$q:lifetime>, $db:ty, $args:ty, |$v:ident| $json:expr) => {
        pub(crate) fn $name<$q>(
            query: sqlx::query::Query<$q, $db, $args>,
            param: &$q QueryParam,
        ) -> sqlx::query::Query<$q, $db, $args> {
            match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(b) => query.bind(*b),
                QueryParam::Int(i) => query.bind(*i),
                QueryParam::Float(f) => query.bind(*f),
                QueryParam::String(s) => query.bind(s.as_str()),
                QueryParam::Bytes(bytes) => query.bind(bytes.as_slice()),
                QueryParam::Json($v) => query.bind($json),
            }
        }
    };
}

bind_fn!(bind_mysql_param<'q>, MySql, MySqlArguments, |v| Json(v));
bind_fn!(bind_postgres_param<'q>, Postgres, PgArguments, |v| Json(v));
// No native JSON type; stored as text
bind_fn!(bind_sqlite_param<'q>, Sqlite, SqliteArguments<'q>, |v| v.to_string());
