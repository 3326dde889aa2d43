//! Binding authenticated identities to server-side sessions.

use chrono::{DateTime, Utc};

use super::session_store::{Session, SessionError, SessionId, SharedSessionStore};
use crate::saml::SamlIdentity;

/// Creates, resolves and destroys sessions.
///
/// Each successful login gets a fresh random ID; IDs are never reused, so a
/// cookie captured before login cannot be upgraded into an authenticated one.
#[derive(Clone)]
pub struct SessionBinder {
    store: SharedSessionStore,
    duration: chrono::Duration,
}

impl SessionBinder {
    pub fn new(store: SharedSessionStore, duration: chrono::Duration) -> Self {
        Self { store, duration }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.duration
    }

    /// Start a session for `identity`.
    pub async fn bind(&self, identity: SamlIdentity) -> Result<SessionId, SessionError> {
        let now = Utc::now();
        let session = Session {
            id: SessionId::generate(),
            identity,
            created_at: now,
            expires_at: now
                .checked_add_signed(self.duration)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let id = session.id.clone();
        self.store.create_session(session).await?;
        Ok(id)
    }

    /// The identity bound to `id`, if the session exists and has not expired.
    ///
    /// Storage failures resolve to `None`.
    pub async fn resolve(&self, id: &SessionId) -> Option<SamlIdentity> {
        let session = match self.store.get_session(id).await {
            Ok(session) => session?,
            Err(e) => {
                tracing::warn!(error = %e, "Session lookup failed; treating request as anonymous");
                return None;
            }
        };

        if session.is_expired_at(Utc::now()) {
            if let Err(e) = self.store.delete_session(id).await {
                tracing::warn!(error = %e, "Failed to delete expired session");
            }
            return None;
        }
        Some(session.identity)
    }

    /// End the session. Destroying an unknown session is not an error.
    pub async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        self.store.delete_session(id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::session_store::{MemorySessionStore, SessionStore, tests::identity};

    fn binder(duration: chrono::Duration) -> (SessionBinder, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        (SessionBinder::new(store.clone(), duration), store)
    }

    #[tokio::test]
    async fn test_bind_and_resolve() {
        let (binder, _) = binder(chrono::Duration::hours(8));

        let id = binder.bind(identity("alice@example.com")).await.unwrap();
        let resolved = binder.resolve(&id).await.unwrap();
        assert_eq!(resolved.name_id, "alice@example.com");
    }

    #[tokio::test]
    async fn test_each_bind_gets_a_fresh_id() {
        let (binder, _) = binder(chrono::Duration::hours(8));

        let first = binder.bind(identity("alice@example.com")).await.unwrap();
        let second = binder.bind(identity("alice@example.com")).await.unwrap();
        assert_ne!(first, second);
        assert!(binder.resolve(&first).await.is_some());
        assert!(binder.resolve(&second).await.is_some());
    }

    #[tokio::test]
    async fn test_unknown_id_resolves_to_none() {
        let (binder, _) = binder(chrono::Duration::hours(8));
        assert!(binder.resolve(&SessionId::generate()).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_removed_on_lookup() {
        let (binder, store) = binder(chrono::Duration::seconds(-1));

        let id = binder.bind(identity("alice@example.com")).await.unwrap();
        assert!(binder.resolve(&id).await.is_none());
        assert!(store.get_session(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (binder, _) = binder(chrono::Duration::hours(8));

        let id = binder.bind(identity("alice@example.com")).await.unwrap();
        binder.destroy(&id).await.unwrap();
        assert!(binder.resolve(&id).await.is_none());
        binder.destroy(&id).await.unwrap();
    }
}
