//! Scoped session factory.
//!
//! Sessions live in a registry keyed by a scope key produced by a scope
//! function. The default scope function returns the key installed with
//! [`with_scope`], else the identity of the running tokio task. Code outside
//! any task (a runtime's `block_on` future, plain threads) is keyed by thread.
//! Tasks migrate between worker threads, so a thread key is never used from
//! inside a spawned task.

use super::session::{RoutedSession, SessionContext, SessionInfo};
use crate::config::{SessionOptions, SessionOptionsUpdate};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Identity of the unit of concurrency a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ScopeKey(String);

impl ScopeKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for the running tokio task, if called from inside one.
    pub fn current_task() -> Option<Self> {
        tokio::task::try_id().map(|id| Self(format!("task:{id}")))
    }

    /// Key for the calling thread.
    pub fn current_thread() -> Self {
        Self(format!("thread:{:?}", std::thread::current().id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for ScopeKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

tokio::task_local! {
    static CURRENT_SCOPE: ScopeKey;
}

/// Produces the scope key for the caller.
pub type ScopeFn = Arc<dyn Fn() -> ScopeKey + Send + Sync>;

/// Task-local scope if set, then the current task, then the current thread.
pub fn default_scope() -> ScopeKey {
    CURRENT_SCOPE
        .try_with(ScopeKey::clone)
        .ok()
        .or_else(ScopeKey::current_task)
        .unwrap_or_else(ScopeKey::current_thread)
}

/// Run `fut` with `key` as its scope.
pub async fn with_scope<F: Future>(key: ScopeKey, fut: F) -> F::Output {
    CURRENT_SCOPE.scope(key, fut).await
}

pub struct SessionFactory {
    context: Arc<SessionContext>,
    scope_fn: ScopeFn,
    options: RwLock<SessionOptions>,
    sessions: tokio::sync::RwLock<HashMap<ScopeKey, Arc<RoutedSession>>>,
}

impl SessionFactory {
    pub fn new(context: Arc<SessionContext>, options: SessionOptions, scope_fn: Option<ScopeFn>) -> Self {
        Self {
            context,
            scope_fn: scope_fn.unwrap_or_else(|| -> ScopeFn { Arc::new(default_scope) }),
            options: RwLock::new(options),
            sessions: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    pub fn current_scope(&self) -> ScopeKey {
        (self.scope_fn)()
    }

    /// Options new sessions are created with.
    pub fn options(&self) -> SessionOptions {
        *self.options.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Session for the current scope, created on first use.
    pub async fn current(&self) -> Arc<RoutedSession> {
        self.get_or_create(self.current_scope()).await
    }

    /// Session for `key`. Concurrent callers with the same key get the same session.
    pub async fn get_or_create(&self, key: ScopeKey) -> Arc<RoutedSession> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&key) {
                return Arc::clone(session);
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&key) {
            return Arc::clone(session);
        }
        let session = Arc::new(RoutedSession::new(
            key.clone(),
            self.options(),
            Arc::clone(&self.context),
        ));
        sessions.insert(key, Arc::clone(&session));
        session
    }

    /// Discard the session for `key`, rolling back anything uncommitted.
    /// Returns false if the scope had no session.
    pub async fn remove(&self, key: &ScopeKey) -> bool {
        let removed = self.sessions.write().await.remove(key);
        match removed {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn remove_current(&self) -> bool {
        self.remove(&self.current_scope()).await
    }

    pub async fn remove_all(&self) {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, session) in &drained {
            session.close().await;
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "Removed all sessions");
        }
    }

    /// Change the options for new sessions. The current scope's session is
    /// removed so its next session picks them up; other scopes keep theirs.
    pub async fn reconfigure(&self, update: &SessionOptionsUpdate) {
        let key = self.current_scope();
        let removed = {
            let mut sessions = self.sessions.write().await;
            self.options
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .apply(update);
            sessions.remove(&key)
        };
        if let Some(session) = removed {
            session.close().await;
        }
        info!(scope = %key, options = ?self.options(), "Session factory reconfigured");
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<RoutedSession>> =
            self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

impl std::fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("options", &self.options())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineOptions;
    use crate::db::EngineRegistry;
    use crate::error::DbError;
    use crate::orm::metadata::Metadata;
    use crate::orm::routing::RoutingPolicy;

    async fn factory() -> SessionFactory {
        let registry = EngineRegistry::connect([("default", "sqlite://")], &EngineOptions::default())
            .await
            .unwrap();
        let policy = RoutingPolicy::new(&registry, None).unwrap();
        let context = Arc::new(SessionContext {
            registry,
            metadata: Arc::new(Metadata::new()),
            policy,
        });
        SessionFactory::new(context, SessionOptions::default(), None)
    }

    #[tokio::test]
    async fn test_same_scope_same_session() {
        let factory = factory().await;
        let a = factory.get_or_create("a".into()).await;
        let again = factory.get_or_create("a".into()).await;
        let b = factory.get_or_create("b".into()).await;

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(factory.len().await, 2);
    }

    #[tokio::test]
    async fn test_task_local_scope() {
        let factory = factory().await;
        let key = with_scope(ScopeKey::new("request-1"), async { factory.current_scope() }).await;
        assert_eq!(key.as_str(), "request-1");
        assert!(factory.current_scope().as_str().starts_with("thread:"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_spawned_task_keeps_its_scope_across_awaits() {
        let factory = Arc::new(factory().await);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let factory = Arc::clone(&factory);
            handles.push(tokio::spawn(async move {
                let first = factory.current_scope();
                for _ in 0..50 {
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    assert_eq!(factory.current_scope(), first);
                }
                first
            }));
        }

        let mut keys = std::collections::HashSet::new();
        for handle in handles {
            let key = handle.await.unwrap();
            assert!(key.as_str().starts_with("task:"));
            keys.insert(key);
        }
        assert_eq!(keys.len(), 8);
    }

    #[tokio::test]
    async fn test_remove_closes_session() {
        let factory = factory().await;
        let session = factory.get_or_create("a".into()).await;
        assert!(factory.remove(&"a".into()).await);
        assert!(!factory.remove(&"a".into()).await);

        assert!(session.is_closed());
        let err = session.flush().await.unwrap_err();
        assert!(matches!(err, DbError::SessionClosed { .. }));

        let fresh = factory.get_or_create("a".into()).await;
        assert_ne!(fresh.id(), session.id());
    }

    #[tokio::test]
    async fn test_reconfigure_applies_to_new_sessions() {
        let factory = factory().await;
        let key = factory.current_scope();
        let other = factory.get_or_create("other".into()).await;
        let before = factory.get_or_create(key.clone()).await;
        assert!(!before.options().autocommit);

        factory
            .reconfigure(&SessionOptionsUpdate::new().autocommit(true))
            .await;

        assert!(before.is_closed());
        assert!(!other.is_closed());
        assert!(!other.options().autocommit);
        let after = factory.get_or_create(key).await;
        assert!(after.options().autocommit);
        assert!(factory.options().autoflush);
    }

    #[tokio::test]
    async fn test_custom_scope_fn() {
        let registry = EngineRegistry::connect([("default", "sqlite://")], &EngineOptions::default())
            .await
            .unwrap();
        let policy = RoutingPolicy::new(&registry, None).unwrap();
        let context = Arc::new(SessionContext {
            registry,
            metadata: Arc::new(Metadata::new()),
            policy,
        });
        let fixed: ScopeFn = Arc::new(|| ScopeKey::new("fixed"));
        let factory = SessionFactory::new(context, SessionOptions::default(), Some(fixed));
        let session = factory.current().await;
        assert_eq!(session.scope().as_str(), "fixed");

        factory.remove_all().await;
        assert!(factory.is_empty().await);
        assert!(session.is_closed());
    }
}
