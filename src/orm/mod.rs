//! Session layer: model metadata, routing, scoped sessions and queries.

pub mod metadata;
pub mod query;
pub mod routing;
pub mod scope;
pub mod session;
pub mod statement;

pub use metadata::{EntityId, Metadata, Model, default_table_name};
pub use query::Query;
pub use routing::{BindHint, Operation, RouteRequest, RoutingPolicy};
pub use scope::{ScopeFn, ScopeKey, SessionFactory, default_scope, with_scope};
pub use session::{RoutedSession, SessionContext, SessionInfo};
